//! Authenticated NATS subscription sessions.
//!
//! A [`Session`] resolves credentials, connects, subscribes in one of three delivery modes
//! (core, JetStream durable pull, JetStream ephemeral push), prints what it receives and drains
//! the connection when its cancellation token fires.

pub mod auth;
pub mod client;
pub mod config;
pub mod display;
pub mod error;
pub mod nats;
pub mod session;

pub use auth::{Credentials, NonceSigner, SigningSupport};
pub use config::{
    ConnectionConfig, DeliveryMode, DurableName, SessionConfig, SubscriptionSpec,
};
pub use error::{Error, Result};
pub use session::{Session, SessionState};
