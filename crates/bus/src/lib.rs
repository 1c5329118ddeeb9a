//! Abstract interface for a streaming message bus client.
//!
//! Backends (NATS, in-memory) implement these traits; the resilient client in
//! `harbor-streaming` is written only against them.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Live sessions with the bus.
pub mod connection;

/// Connectors open new sessions with the bus.
pub mod connector;

/// Failure classification shared by every backend.
pub mod error;

/// Messages, message identifiers and publish acknowledgements.
pub mod message;

/// Subscriptions are live interests in a subject.
pub mod subscription;

/// Subscription handlers process messages delivered to subscriptions.
pub mod subscription_handler;

pub use connection::Connection;
pub use connector::{ConnectOptions, ConnectionLost, ConnectionLostHandler, Connector};
pub use error::{BusError, FailureKind};
pub use message::{Ack, AckCallback, Message, MessageId};
pub use subscription::{Subscription, SubscriptionOptions};
pub use subscription_handler::SubscriptionHandler;
