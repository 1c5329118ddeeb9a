//! Resilient publish/subscribe client for a streaming message bus.
//!
//! [`StreamingClient`] keeps a connection to the bus alive across outages:
//!
//! - connecting retries until it succeeds;
//! - a lost connection is replaced by a new one in the background;
//! - subscriptions made with [`StreamingClient::register`] are restored on
//!   every new connection;
//! - [`StreamingClient::safe_publish`] caches publishes that cannot be
//!   delivered and replays them once a connection is back.
//!
//! ```
//! use harbor_bus::Message;
//! use harbor_bus_memory::MemoryBus;
//! use harbor_streaming::{StreamingClient, StreamingConfig, SubscriptionSpec};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StreamingClient::new(
//!     MemoryBus::new(),
//!     StreamingConfig {
//!         cluster_id: "local".to_string(),
//!         client_id: "orders-service".to_string(),
//!         ..StreamingConfig::default()
//!     },
//! );
//! client.connect().await?;
//!
//! client
//!     .register(
//!         "order-events",
//!         SubscriptionSpec::new("orders.*", |message: Message| {
//!             println!("{}: {:?}", message.subject, message.payload);
//!         }),
//!     )
//!     .await?;
//!
//! client.safe_publish("orders.created", "order-1", None).await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cache;
mod client;
mod config;
mod error;
mod gateway;
mod manager;
mod registry;

pub use cache::ReplayCache;
pub use client::StreamingClient;
pub use config::{
    DEFAULT_MAX_PINGS_OUT, DEFAULT_PING_INTERVAL, DEFAULT_RECONNECT_INTERVAL,
    DEFAULT_REPLAY_CAPACITY, DEFAULT_URL, StreamingConfig,
};
pub use error::Error;
pub use gateway::{AckHandler, DropListener, DropReason, PendingPublish, ReplayReport, ReplayStats};
pub use manager::{
    ConnectionState, LiveConnection, RecoveryReport, RegistrationStatus, ReinstateReport,
};
pub use registry::{RegisteredSpec, SubscriptionRegistry, SubscriptionSpec};

use harbor_bus::{Connection, Connector};

/// Error type of a connector.
pub type BusErrorOf<C> = <C as Connector>::Error;

/// Subscription handle type of a connector's connections.
pub type SubscriptionOf<C> = <<C as Connector>::Connection as Connection>::Subscription;

/// Subscription options type of a connector's connections.
pub type SubscriptionOptionsOf<C> =
    <<C as Connector>::Connection as Connection>::SubscriptionOptions;
