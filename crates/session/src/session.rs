//! The session lifecycle: authenticate, connect, subscribe, consume, drain
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::auth::{self, SigningSupport};
use crate::client::{
    Connection, Connector, Delivery, DeliveryStream, MessageStream, PullConsumer,
};
use crate::config::{DeliveryMode, SessionConfig};
use crate::display::{render_core, render_plain, render_sequenced};
use crate::error::Result;
use crate::nats::NatsConnector;

/// Maximum number of messages requested by a single pull
pub const FETCH_BATCH_SIZE: usize = 10;
/// How long a pull waits for messages before returning an empty batch
pub const FETCH_EXPIRES: Duration = Duration::from_secs(5);
/// Upper bound on the drain at shutdown
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Lifecycle state of a [`Session`].
///
/// `Connecting -> Authenticated -> Subscribed -> Draining -> Closed`, with `Failed` reachable
/// from `Connecting` and `Authenticated`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticated,
    Subscribed,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// The subscription a session consumes from, one per delivery mode
enum Active {
    Core(MessageStream),
    Pull(Box<dyn PullConsumer>),
    Push(DeliveryStream),
}

/// Owns a single authenticated subscription from connect to close
pub struct Session<C = NatsConnector> {
    config: SessionConfig,
    connector: C,
    signing: SigningSupport,
    state: watch::Sender<SessionState>,
}

impl Session<NatsConnector> {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, NatsConnector)
    }
}

impl<C: Connector> Session<C> {
    pub fn with_connector(config: SessionConfig, connector: C) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            config,
            connector,
            signing: SigningSupport::detect(),
            state,
        }
    }

    /// Override the detected signing support
    pub fn signing_support(mut self, signing: SigningSupport) -> Self {
        self.signing = signing;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions as they happen
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        debug!(?previous, ?next, "session state changed");
    }

    /// Run the session until `shutdown` is cancelled or the subscription ends.
    ///
    /// Configuration, credential, connection and subscription failures move the session to
    /// [`SessionState::Failed`] and are returned. Once subscribed, the session always ends in
    /// [`SessionState::Closed`]: cancellation is a normal shutdown, while a fatal fetch error is
    /// returned after the connection has been drained.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.transition(SessionState::Connecting);
        let connection = match self.connect().await {
            Ok(connection) => connection,
            Err(err) => {
                self.transition(SessionState::Failed);
                return Err(err);
            }
        };
        self.transition(SessionState::Authenticated);

        let active = match self.subscribe(connection.as_ref()).await {
            Ok(active) => active,
            Err(err) => {
                self.transition(SessionState::Failed);
                return Err(err);
            }
        };
        self.transition(SessionState::Subscribed);

        let outcome = match active {
            Active::Core(messages) => consume_core(messages, &shutdown).await,
            Active::Pull(consumer) => consume_pull(consumer.as_ref(), &shutdown).await,
            Active::Push(deliveries) => consume_push(deliveries, &shutdown).await,
        };

        self.transition(SessionState::Draining);
        drain(connection.as_ref()).await;
        self.transition(SessionState::Closed);
        outcome
    }

    #[instrument(level = "info", skip_all, fields(server = %self.config.connection.server))]
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.config.subscription.validate()?;
        let credentials = auth::resolve(&self.config.connection, self.signing).await?;
        info!("connecting to NATS");
        let connection = self
            .connector
            .connect(&self.config.connection, credentials)
            .await?;
        info!("connected to NATS");
        Ok(connection)
    }

    async fn subscribe(&self, connection: &dyn Connection) -> Result<Active> {
        let subject = self.config.subscription.subject.as_str();
        match &self.config.subscription.mode {
            DeliveryMode::CorePushFanout { queue } => {
                let messages = connection.subscribe_core(subject, queue.as_deref()).await?;
                info!(%subject, ?queue, "listening on core subject, press Ctrl-C to exit");
                Ok(Active::Core(messages))
            }
            DeliveryMode::JetStreamPullDurable { durable } => {
                let consumer = connection
                    .open_pull_consumer(subject, durable.as_str())
                    .await?;
                info!(%subject, ?durable, "attached to JetStream durable pull consumer");
                Ok(Active::Pull(consumer))
            }
            DeliveryMode::JetStreamPushEphemeral => {
                let deliveries = connection.subscribe_push(subject, None).await?;
                info!(%subject, "listening on JetStream ephemeral push consumer");
                Ok(Active::Push(deliveries))
            }
        }
    }
}

async fn consume_core(mut messages: MessageStream, shutdown: &CancellationToken) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            msg = messages.next() => match msg {
                Some(msg) => println!("{}", render_core(&msg)),
                None => {
                    warn!("subscription closed by the server");
                    return Ok(());
                }
            },
        }
    }
}

/// Fetch, print and acknowledge batches until cancelled.
///
/// A fetched batch is always fully acknowledged before cancellation is checked again.
async fn consume_pull(consumer: &dyn PullConsumer, shutdown: &CancellationToken) -> Result<()> {
    loop {
        let batch = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            batch = consumer.fetch(FETCH_BATCH_SIZE, FETCH_EXPIRES) => batch?,
        };
        if batch.is_empty() {
            trace!("fetch expired without messages");
            continue;
        }
        for delivery in batch {
            println!("{}", render_sequenced(&delivery.message));
            acknowledge(delivery).await;
        }
    }
}

async fn consume_push(mut deliveries: DeliveryStream, shutdown: &CancellationToken) -> Result<()> {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(()),
            delivery = deliveries.next() => match delivery {
                Some(Ok(delivery)) => {
                    println!("{}", render_plain(&delivery.message));
                    acknowledge(delivery).await;
                }
                Some(Err(err)) => warn!(error = ?err, "failed to receive message"),
                None => {
                    warn!("consumer closed by the server");
                    return Ok(());
                }
            },
        }
    }
}

/// Acknowledge a delivery, logging a failure instead of returning it
async fn acknowledge(delivery: Delivery) {
    let subject = delivery.message.subject.clone();
    let sequence = delivery.message.sequence;
    if let Err(err) = delivery.ack().await {
        warn!(%subject, ?sequence, error = ?err, "failed to acknowledge message");
    }
}

async fn drain(connection: &dyn Connection) {
    match tokio::time::timeout(DRAIN_TIMEOUT, connection.drain()).await {
        Ok(Ok(())) => debug!("connection drained"),
        Ok(Err(err)) => warn!(error = ?err, "failed to drain connection"),
        Err(_) => warn!(timeout = ?DRAIN_TIMEOUT, "timed out draining connection"),
    }
}
