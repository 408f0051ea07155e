//! `async-nats` implementation of the messaging client boundary
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, push, AckPolicy},
};
use async_nats::{ConnectOptions, Event, HeaderMap, HeaderValue};
use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::Credentials;
use crate::client::{
    Acknowledge, Connection, Connector, Delivery, DeliveryStream, InboundMessage, MessageStream,
    PullConsumer,
};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

/// Logs transport events reported by the client: disconnection (warn), reconnection (info),
/// client and server errors (error), slow consumer and lame duck mode (warn).
///
/// `closed` is set once the client has written everything and shut its connection down.
pub fn with_connection_event_logging(
    opts: ConnectOptions,
    closed: watch::Sender<bool>,
) -> ConnectOptions {
    let closed = Arc::new(closed);
    opts.event_callback(move |event| {
        let closed = Arc::clone(&closed);
        async move {
            match event {
                Event::Disconnected => warn!("nats client disconnected"),
                Event::Connected => info!("nats client connected"),
                Event::ClientError(err) => error!("nats client error: '{:?}'", err),
                Event::ServerError(err) => error!("nats server error: '{:?}'", err),
                Event::SlowConsumer(val) => warn!("nats slow consumer detected ({})", val),
                Event::LameDuckMode => warn!("nats lame duck mode"),
                Event::Closed => {
                    debug!("nats client closed");
                    closed.send_replace(true);
                }
                other => debug!("nats client event: {other}"),
            }
        }
    })
}

/// Connects to a NATS server with `async-nats`
#[derive(Clone, Copy, Debug, Default)]
pub struct NatsConnector;

#[async_trait]
impl Connector for NatsConnector {
    #[instrument(level = "debug", skip_all, fields(server = %config.server))]
    async fn connect(
        &self,
        config: &ConnectionConfig,
        credentials: Credentials,
    ) -> Result<Box<dyn Connection>> {
        let opts = match credentials {
            Credentials::CredsFile(path) => ConnectOptions::with_credentials_file(path.clone())
                .await
                .map_err(|e| Error::credentials_io(path, e))?,
            Credentials::Jwt { jwt, signer } => {
                let signer = Arc::new(signer);
                ConnectOptions::with_jwt(jwt, move |nonce| {
                    let signer = Arc::clone(&signer);
                    async move { signer.sign(&nonce).map_err(async_nats::AuthError::new) }
                })
            }
        };

        let (closed_tx, closed) = watch::channel(false);
        let mut opts = with_connection_event_logging(opts, closed_tx).name(&config.name);
        if let Some(ca_file) = &config.tls_ca_file {
            opts = opts.add_root_certificates(ca_file.clone()).require_tls(true);
        }
        if config.tls_first {
            opts = opts.tls_first();
        }

        let client = opts
            .connect(config.server.as_str())
            .await
            .map_err(|e| Error::Connect {
                server: config.server.clone(),
                source: e.into(),
            })?;

        let jetstream = match &config.js_domain {
            Some(domain) => jetstream::with_domain(client.clone(), domain),
            None => jetstream::new(client.clone()),
        };
        Ok(Box::new(NatsConnection {
            client,
            jetstream,
            closed,
        }))
    }
}

/// A connected client and its JetStream context
pub struct NatsConnection {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    closed: watch::Receiver<bool>,
}

impl NatsConnection {
    /// Find the stream that captures `subject`
    async fn stream_for(&self, subject: &str) -> Result<jetstream::stream::Stream> {
        let name = self
            .jetstream
            .stream_by_subject(subject)
            .await
            .map_err(|e| subscribe_error(subject, e))?;
        debug!(stream = %name, %subject, "found stream for subject");
        self.jetstream
            .get_stream(&name)
            .await
            .map_err(|e| subscribe_error(subject, e))
    }
}

fn subscribe_error(subject: &str, err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::Subscribe {
        subject: subject.to_string(),
        source: Box::new(err),
    }
}

#[async_trait]
impl Connection for NatsConnection {
    async fn subscribe_core(&self, subject: &str, queue: Option<&str>) -> Result<MessageStream> {
        let subscriber = match queue {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_string(), queue.to_string())
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        }
        .map_err(|e| subscribe_error(subject, e))?;

        Ok(subscriber.map(inbound_from_core).boxed())
    }

    #[instrument(level = "debug", skip(self))]
    async fn open_pull_consumer(
        &self,
        subject: &str,
        durable: &str,
    ) -> Result<Box<dyn PullConsumer>> {
        let stream = self.stream_for(subject).await?;
        let consumer = stream
            .get_or_create_consumer(
                durable,
                pull::Config {
                    durable_name: Some(durable.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| subscribe_error(subject, e))?;

        let existing_filter = &consumer.cached_info().config.filter_subject;
        if existing_filter != subject {
            warn!(
                %durable,
                %existing_filter,
                expected = %subject,
                "durable consumer already exists with a different filter subject"
            );
        }
        Ok(Box::new(NatsPullConsumer { consumer }))
    }

    #[instrument(level = "debug", skip(self))]
    async fn subscribe_push(
        &self,
        subject: &str,
        durable: Option<&str>,
    ) -> Result<DeliveryStream> {
        let stream = self.stream_for(subject).await?;
        let config = push::Config {
            deliver_subject: self.client.new_inbox(),
            durable_name: durable.map(str::to_string),
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            ..Default::default()
        };
        let consumer = match durable {
            Some(durable) => stream.get_or_create_consumer(durable, config).await,
            None => stream.create_consumer(config).await,
        }
        .map_err(|e| subscribe_error(subject, e))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_error(subject, e))?;

        Ok(messages
            .map(|msg| match msg {
                Ok(msg) => Ok(delivery_from_jetstream(msg)),
                Err(err) => Err(Error::Fetch(err.into())),
            })
            .boxed())
    }

    async fn drain(&self) -> Result<()> {
        if let Err(err) = self.client.flush().await {
            warn!(%err, "failed to flush before draining");
        }
        self.client
            .drain()
            .await
            .map_err(|e| Error::Drain(e.into()))?;

        // drain() only queues the request, the handler reports when it has actually closed
        let mut closed = self.closed.clone();
        if closed.wait_for(|closed| *closed).await.is_err() {
            debug!("connection handler exited without reporting close");
        }
        Ok(())
    }
}

/// A durable pull consumer
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::Consumer<pull::Config>,
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch(&self, max_messages: usize, expires: Duration) -> Result<Vec<Delivery>> {
        // batch() holds the pull request open for `expires`; fetch() asks with no_wait and
        // can come back empty straight away
        let mut batch = self
            .consumer
            .batch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| Error::Fetch(e.into()))?;

        let mut deliveries = Vec::with_capacity(max_messages);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => deliveries.push(delivery_from_jetstream(msg)),
                // keep what was already received, it still has to be acknowledged
                Err(err) if !deliveries.is_empty() => {
                    warn!(%err, received = deliveries.len(), "batch ended early");
                    break;
                }
                Err(err) => return Err(Error::Fetch(err.into())),
            }
        }
        Ok(deliveries)
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acknowledge for JetStreamAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack().await.map_err(|e| Error::Ack(e.into()))
    }
}

fn convert_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, values)| {
            let values: Vec<&str> = values.iter().map(HeaderValue::as_str).collect();
            (name.to_string(), values.join(","))
        })
        .collect()
}

fn inbound_from_core(msg: async_nats::Message) -> InboundMessage {
    InboundMessage {
        subject: msg.subject.to_string(),
        headers: msg.headers.as_ref().map(convert_headers),
        payload: msg.payload,
        sequence: None,
    }
}

fn delivery_from_jetstream(msg: jetstream::Message) -> Delivery {
    let sequence = msg.info().ok().map(|info| info.stream_sequence);
    let inbound = InboundMessage {
        subject: msg.subject.to_string(),
        payload: msg.payload.clone(),
        sequence,
        headers: msg.headers.as_ref().map(convert_headers),
    };
    Delivery::new(inbound, Box::new(JetStreamAcker(msg)))
}
