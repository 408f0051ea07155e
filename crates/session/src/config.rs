//! Connection and subscription configuration for a session
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};

pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4223";
pub const DEFAULT_SUBJECT: &str = "basic.>";
pub const DEFAULT_DURABLE_NAME: &str = "pump_consumer";
pub const DEFAULT_CONNECTION_NAME: &str = "nats-pump";

/// Connection options as supplied by the operator.
///
/// The authentication fields are kept as given so that validation happens when the session
/// starts, before any connection attempt. Use [`ConnectionConfig::auth_mode`] to check them
/// ahead of time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// NATS server URL
    pub server: String,
    /// Credsfile combining a user JWT and seed.
    /// See <https://docs.nats.io/using-nats/developer/connecting/creds> for details.
    pub creds: Option<PathBuf>,
    /// File containing the user JWT. Must be supplied with `nkey`.
    pub jwt: Option<PathBuf>,
    /// File containing the user nkey seed. Must be supplied with `jwt`.
    pub nkey: Option<PathBuf>,
    /// Path to a file containing a CA certificate to use for TLS connections
    pub tls_ca_file: Option<PathBuf>,
    /// Perform TLS handshake before expecting the server greeting.
    pub tls_first: bool,
    /// Connection name shown in the server's connection list
    pub name: String,
    /// JetStream domain, if the stream lives outside the default domain
    pub js_domain: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            creds: None,
            jwt: None,
            nkey: None,
            tls_ca_file: None,
            tls_first: false,
            name: DEFAULT_CONNECTION_NAME.to_string(),
            js_domain: None,
        }
    }
}

/// The authentication mode selected by a [`ConnectionConfig`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthMode<'a> {
    CredsFile(&'a Path),
    JwtNkey { jwt: &'a Path, nkey: &'a Path },
}

impl ConnectionConfig {
    /// Determine which authentication mode the configuration selects.
    ///
    /// A credsfile takes precedence over a JWT and seed pair. Supplying only one half of the
    /// JWT and seed pair, or nothing at all, is a configuration error.
    pub fn auth_mode(&self) -> Result<AuthMode<'_>> {
        match (&self.creds, &self.jwt, &self.nkey) {
            (Some(creds), jwt, nkey) => {
                if jwt.is_some() || nkey.is_some() {
                    warn!(
                        creds = %creds.display(),
                        "both a credsfile and jwt/nkey were supplied, using the credsfile"
                    );
                }
                Ok(AuthMode::CredsFile(creds))
            }
            (None, Some(jwt), Some(nkey)) => Ok(AuthMode::JwtNkey { jwt, nkey }),
            (None, Some(_), None) | (None, None, Some(_)) => Err(Error::Config(
                "cannot authenticate if only one of jwt or nkey is specified".into(),
            )),
            (None, None, None) => Err(Error::Config(
                "must supply either a credsfile or both a jwt and an nkey".into(),
            )),
        }
    }
}

/// Durable consumer name for pull mode.
///
/// An explicitly chosen name and a defaulted one are kept apart so the origin of the name is
/// visible in logs and tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DurableName {
    Explicit(String),
    Defaulted,
}

impl DurableName {
    /// Treat an empty name the same as no name.
    pub fn from_option(name: Option<String>) -> Self {
        match name {
            Some(name) if !name.trim().is_empty() => DurableName::Explicit(name),
            _ => DurableName::Defaulted,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DurableName::Explicit(name) => name,
            DurableName::Defaulted => DEFAULT_DURABLE_NAME,
        }
    }
}

/// How messages are delivered to the session
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Core NATS subscription, optionally load-shared through a queue group
    CorePushFanout { queue: Option<String> },
    /// JetStream durable pull consumer, acknowledged explicitly after each fetch
    JetStreamPullDurable { durable: DurableName },
    /// JetStream ephemeral push consumer, discarded by the server on disconnect
    JetStreamPushEphemeral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSpec {
    pub subject: String,
    pub mode: DeliveryMode,
}

impl SubscriptionSpec {
    pub fn core(subject: impl Into<String>, queue: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            mode: DeliveryMode::CorePushFanout { queue },
        }
    }

    pub fn pull_durable(subject: impl Into<String>, durable: Option<String>) -> Self {
        Self {
            subject: subject.into(),
            mode: DeliveryMode::JetStreamPullDurable {
                durable: DurableName::from_option(durable),
            },
        }
    }

    pub fn push_ephemeral(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            mode: DeliveryMode::JetStreamPushEphemeral,
        }
    }

    /// Build a spec from the command line switches.
    ///
    /// A queue group only applies to core subscriptions and is ignored (with a warning) in
    /// JetStream modes. A durable name cannot be combined with an ephemeral consumer.
    pub fn from_options(
        subject: String,
        queue: Option<String>,
        jetstream: bool,
        durable: Option<String>,
        ephemeral: bool,
    ) -> Result<Self> {
        let queue = queue.filter(|q| !q.trim().is_empty());
        if jetstream && queue.is_some() {
            warn!(?queue, "queue groups only apply to core subscriptions, ignoring");
        }
        let spec = match (jetstream, ephemeral) {
            (false, true) => {
                return Err(Error::Config(
                    "an ephemeral consumer requires JetStream to be enabled".into(),
                ))
            }
            (false, false) => {
                if durable.is_some() {
                    warn!(?durable, "durable names only apply to JetStream, ignoring");
                }
                Self::core(subject, queue)
            }
            (true, true) if durable.is_some() => {
                return Err(Error::Config(
                    "a durable name cannot be used with an ephemeral consumer".into(),
                ))
            }
            (true, true) => Self::push_ephemeral(subject),
            (true, false) => Self::pull_durable(subject, durable),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check that the subject is usable for a subscription.
    pub fn validate(&self) -> Result<()> {
        if self.subject.is_empty() {
            return Err(Error::Config("subject must not be empty".into()));
        }
        if self.subject.chars().any(char::is_whitespace) {
            return Err(Error::Config(format!(
                "subject `{}` must not contain whitespace",
                self.subject
            )));
        }
        if self.subject.split('.').any(str::is_empty) {
            return Err(Error::Config(format!(
                "subject `{}` contains an empty token",
                self.subject
            )));
        }
        Ok(())
    }
}

/// Everything a session needs, built once at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub connection: ConnectionConfig,
    pub subscription: SubscriptionSpec,
}

#[cfg(test)]
mod test {
    use super::*;

    fn with_auth(creds: Option<&str>, jwt: Option<&str>, nkey: Option<&str>) -> ConnectionConfig {
        ConnectionConfig {
            creds: creds.map(PathBuf::from),
            jwt: jwt.map(PathBuf::from),
            nkey: nkey.map(PathBuf::from),
            ..Default::default()
        }
    }

    #[test]
    fn auth_mode_requires_credentials() {
        assert!(matches!(
            with_auth(None, None, None).auth_mode(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            with_auth(None, Some("user.jwt"), None).auth_mode(),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            with_auth(None, None, Some("user.nk")).auth_mode(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn creds_take_precedence() {
        let cfg = with_auth(Some("user.creds"), Some("user.jwt"), Some("user.nk"));
        assert_eq!(
            cfg.auth_mode().unwrap(),
            AuthMode::CredsFile(Path::new("user.creds"))
        );

        let cfg = with_auth(None, Some("user.jwt"), Some("user.nk"));
        assert_eq!(
            cfg.auth_mode().unwrap(),
            AuthMode::JwtNkey {
                jwt: Path::new("user.jwt"),
                nkey: Path::new("user.nk"),
            }
        );
    }

    #[test]
    fn durable_name_states() {
        assert_eq!(DurableName::from_option(None), DurableName::Defaulted);
        assert_eq!(
            DurableName::from_option(Some(String::new())),
            DurableName::Defaulted
        );
        assert_eq!(DurableName::Defaulted.as_str(), "pump_consumer");
        assert_eq!(
            DurableName::from_option(Some("proc1".into())).as_str(),
            "proc1"
        );
    }

    #[test]
    fn spec_from_options() {
        let spec =
            SubscriptionSpec::from_options("basic.>".into(), Some("workers".into()), false, None, false)
                .unwrap();
        assert_eq!(
            spec.mode,
            DeliveryMode::CorePushFanout {
                queue: Some("workers".into())
            }
        );

        let spec = SubscriptionSpec::from_options(
            "orders.created".into(),
            None,
            true,
            Some("proc1".into()),
            false,
        )
        .unwrap();
        assert_eq!(
            spec.mode,
            DeliveryMode::JetStreamPullDurable {
                durable: DurableName::Explicit("proc1".into())
            }
        );

        let spec =
            SubscriptionSpec::from_options("orders.*".into(), Some("workers".into()), true, None, true)
                .unwrap();
        assert_eq!(spec.mode, DeliveryMode::JetStreamPushEphemeral);
    }

    #[test]
    fn spec_from_options_rejects_conflicts() {
        assert!(matches!(
            SubscriptionSpec::from_options("a.b".into(), None, false, None, true),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            SubscriptionSpec::from_options("a.b".into(), None, true, Some("d".into()), true),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn subject_validation() {
        assert!(SubscriptionSpec::core("basic.>", None).validate().is_ok());
        assert!(SubscriptionSpec::core("", None).validate().is_err());
        assert!(SubscriptionSpec::core("basic. >", None).validate().is_err());
        assert!(SubscriptionSpec::core("basic..x", None).validate().is_err());
    }
}
