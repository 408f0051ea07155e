use std::path::PathBuf;

use thiserror::Error;

/// Boxed error produced by the underlying messaging client.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors produced while establishing or running a session.
///
/// [`Error::Config`], [`Error::MissingDependency`] and [`Error::Credentials`] are always raised
/// before any network call is attempted.
#[derive(Error, Debug)]
pub enum Error {
    /// Authentication or subscription configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A capability required by the configuration was not compiled in.
    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),
    /// A credential file could not be read or did not hold a usable value.
    #[error("failed to load credentials from `{}`: {reason}", path.display())]
    Credentials {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },
    /// The server could not be reached or refused the connection.
    #[error("could not connect to NATS server `{server}`")]
    Connect {
        server: String,
        #[source]
        source: BoxError,
    },
    /// A subscription or consumer could not be created.
    #[error("failed to subscribe to `{subject}`")]
    Subscribe {
        subject: String,
        #[source]
        source: BoxError,
    },
    /// A pull request failed for a reason other than an empty wait.
    #[error("failed to fetch messages")]
    Fetch(#[source] BoxError),
    /// Acknowledging a single message failed.
    #[error("failed to acknowledge message")]
    Ack(#[source] BoxError),
    /// The connection could not be drained cleanly.
    #[error("failed to drain connection")]
    Drain(#[source] BoxError),
}

impl Error {
    pub(crate) fn credentials(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Credentials {
            path: path.into(),
            reason: reason.into(),
            source: None,
        }
    }

    pub(crate) fn credentials_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        Error::Credentials {
            path: path.into(),
            reason: "file could not be read".into(),
            source: Some(Box::new(err)),
        }
    }

    /// Returns true for errors that are raised before any connection attempt.
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::MissingDependency(_) | Error::Credentials { .. }
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
