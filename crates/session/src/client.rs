//! The messaging client boundary used by a session
//!
//! [`crate::nats`] provides the implementation backed by `async-nats`. Sessions only see these
//! traits, which keeps the lifecycle testable against an in-memory client.
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::auth::Credentials;
use crate::config::ConnectionConfig;
use crate::error::Result;

/// A message as delivered by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Stream sequence, present for JetStream deliveries
    pub sequence: Option<u64>,
    /// Header values, multi-valued headers joined with `,`
    pub headers: Option<BTreeMap<String, String>>,
}

/// Acknowledges a single JetStream delivery
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A JetStream message paired with the handle that acknowledges it.
///
/// [`Delivery::ack`] consumes the delivery, so a message is acknowledged at most once.
pub struct Delivery {
    pub message: InboundMessage,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: InboundMessage, acker: Box<dyn Acknowledge>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

pub type MessageStream = BoxStream<'static, InboundMessage>;
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Establishes authenticated connections
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect using the resolved credentials.
    ///
    /// Asynchronous transport events after the connection is established are reported to the
    /// log and never end the connection from this side.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credentials: Credentials,
    ) -> Result<Box<dyn Connection>>;
}

/// An established connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Subscribe to `subject`, within `queue` when given
    async fn subscribe_core(&self, subject: &str, queue: Option<&str>) -> Result<MessageStream>;

    /// Create or attach to the durable pull consumer `durable` filtered on `subject`
    async fn open_pull_consumer(
        &self,
        subject: &str,
        durable: &str,
    ) -> Result<Box<dyn PullConsumer>>;

    /// Create a push consumer on `subject`. Without a durable name the consumer is ephemeral.
    async fn subscribe_push(&self, subject: &str, durable: Option<&str>)
        -> Result<DeliveryStream>;

    /// Drain subscriptions and close the connection once in-flight work has completed
    async fn drain(&self) -> Result<()>;
}

#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Request up to `max_messages`, waiting at most `expires`.
    ///
    /// An expiry with nothing to deliver yields an empty batch, not an error.
    async fn fetch(&self, max_messages: usize, expires: Duration) -> Result<Vec<Delivery>>;
}
