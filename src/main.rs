#![warn(clippy::pedantic)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use nats_pump_session::config::{DEFAULT_CONNECTION_NAME, DEFAULT_SERVER, DEFAULT_SUBJECT};
use nats_pump_session::{ConnectionConfig, Session, SessionConfig, SubscriptionSpec};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

/// Exit code used when a second interrupt forces the process down
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
/// Print messages from a NATS subject, a JetStream durable pull consumer or a JetStream
/// ephemeral push consumer
struct Args {
    /// NATS server URL
    #[clap(long = "server", env = "NATS_SERVER", default_value = DEFAULT_SERVER)]
    server: String,

    /// Credsfile for authentication. Takes precedence over `--jwt` and `--nkey`.
    /// See <https://docs.nats.io/using-nats/developer/connecting/creds> for details.
    #[clap(long = "creds", env = "NATS_CREDS", hide_env_values = true)]
    creds: Option<PathBuf>,

    /// JWT file for authentication. Must be supplied with `--nkey`.
    #[clap(long = "jwt", env = "NATS_JWT", hide_env_values = true)]
    jwt: Option<PathBuf>,

    /// Nkey seed file for authentication. Must be supplied with `--jwt`.
    #[clap(long = "nkey", env = "NATS_NKEY", hide_env_values = true)]
    nkey: Option<PathBuf>,

    /// Subject to subscribe to, wildcards allowed
    #[clap(long = "subject", env = "NATS_SUBJECT", default_value = DEFAULT_SUBJECT)]
    subject: String,

    /// Queue group for core subscriptions
    #[clap(long = "queue", env = "NATS_QUEUE")]
    queue: Option<String>,

    /// Use a JetStream durable pull consumer instead of a plain subscription
    #[clap(long = "jetstream", env = "NATS_JETSTREAM")]
    jetstream: bool,

    /// Durable consumer name for JetStream, defaults to `pump_consumer`
    #[clap(long = "durable", env = "NATS_DURABLE")]
    durable: Option<String>,

    /// Use an ephemeral JetStream push consumer instead of a durable pull consumer
    #[clap(
        long = "ephemeral",
        env = "NATS_EPHEMERAL",
        requires = "jetstream",
        conflicts_with = "durable"
    )]
    ephemeral: bool,

    /// Path to a file containing a CA certificate to use for TLS connections
    #[clap(long = "tls-ca-file", env = "NATS_TLS_CA_FILE")]
    tls_ca_file: Option<PathBuf>,

    /// Perform TLS handshake before expecting the server greeting
    #[clap(long = "tls-first", env = "NATS_TLS_FIRST")]
    tls_first: bool,

    /// JetStream domain of the consumed stream
    #[clap(long = "js-domain", env = "NATS_JS_DOMAIN")]
    js_domain: Option<String>,

    /// Connection name shown by the server
    #[clap(long = "name", env = "NATS_CONNECTION_NAME", default_value = DEFAULT_CONNECTION_NAME)]
    name: String,
}

impl Args {
    fn into_config(self) -> nats_pump_session::Result<SessionConfig> {
        let subscription = SubscriptionSpec::from_options(
            self.subject,
            self.queue,
            self.jetstream,
            self.durable,
            self.ephemeral,
        )?;
        Ok(SessionConfig {
            connection: ConnectionConfig {
                server: self.server,
                creds: self.creds,
                jwt: self.jwt,
                nkey: self.nkey,
                tls_ca_file: self.tls_ca_file,
                tls_first: self.tls_first,
                name: self.name,
                js_domain: self.js_domain,
            },
            subscription,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let session = Session::new(args.into_config()?);
    let subject = session.config().subscription.subject.clone();
    let shutdown = CancellationToken::new();
    tokio::spawn(forward_signals(shutdown.clone()));

    session
        .run(shutdown)
        .await
        .map_err(|err| {
            let context = failure_context(&err, &subject);
            anyhow::Error::new(err).context(context)
        })?;
    info!("session closed");
    Ok(())
}

fn failure_context(err: &nats_pump_session::Error, subject: &str) -> String {
    if err.is_startup_error() {
        "could not start session, nothing was sent to the server".to_string()
    } else {
        format!("session on `{subject}` failed")
    }
}

/// Cancel `shutdown` on the first interrupt and exit immediately on the second
async fn forward_signals(shutdown: CancellationToken) {
    if let Err(err) = shutdown_signal().await {
        error!(?err, "failed to listen for shutdown signals");
        return;
    }
    eprintln!("\nInterrupted, shutting down...");
    shutdown.cancel();

    if shutdown_signal().await.is_ok() {
        warn!("interrupted again, exiting without draining");
        std::process::exit(FORCED_EXIT_CODE);
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    tokio::select! {
        sig = signal::ctrl_c() => sig,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    signal::ctrl_c().await
}

#[cfg(test)]
mod test {
    use clap::CommandFactory as _;
    use nats_pump_session::{DeliveryMode, DurableName};

    use super::*;

    #[test]
    fn args_are_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_select_core_subscription() -> anyhow::Result<()> {
        let config = Args::try_parse_from(["nats-pump", "--creds", "user.creds"])?.into_config()?;
        assert_eq!(config.connection.server, "nats://127.0.0.1:4223");
        assert_eq!(config.connection.name, "nats-pump");
        assert_eq!(config.subscription.subject, "basic.>");
        assert_eq!(
            config.subscription.mode,
            DeliveryMode::CorePushFanout { queue: None }
        );
        Ok(())
    }

    #[test]
    fn jetstream_without_durable_is_defaulted() -> anyhow::Result<()> {
        let config = Args::try_parse_from([
            "nats-pump",
            "--jwt",
            "user.jwt",
            "--nkey",
            "user.nk",
            "--subject",
            "orders.created",
            "--jetstream",
        ])?
        .into_config()?;
        assert_eq!(
            config.subscription.mode,
            DeliveryMode::JetStreamPullDurable {
                durable: DurableName::Defaulted
            }
        );
        assert_eq!(config.connection.jwt, Some(PathBuf::from("user.jwt")));
        Ok(())
    }

    #[test]
    fn failure_context_separates_startup_errors() {
        let startup = nats_pump_session::Error::Config("no credentials".into());
        assert_eq!(
            failure_context(&startup, "basic.>"),
            "could not start session, nothing was sent to the server"
        );
        let runtime = nats_pump_session::Error::Fetch("consumer deleted".into());
        assert_eq!(
            failure_context(&runtime, "orders.created"),
            "session on `orders.created` failed"
        );
    }

    #[test]
    fn ephemeral_requires_jetstream() {
        assert!(Args::try_parse_from(["nats-pump", "--ephemeral"]).is_err());
        assert!(
            Args::try_parse_from(["nats-pump", "--jetstream", "--ephemeral", "--durable", "d"])
                .is_err()
        );
        let args = Args::try_parse_from(["nats-pump", "--jetstream", "--ephemeral"])
            .expect("valid arguments");
        assert_eq!(
            args.into_config().expect("valid config").subscription.mode,
            DeliveryMode::JetStreamPushEphemeral
        );
    }
}
