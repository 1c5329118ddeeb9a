//! NATS implementation of the bus crate.
//!
//! Publishes go through JetStream so every accepted message gets a
//! server acknowledgement; subscriptions use core NATS subjects.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod error;
mod subscription;

pub use connection::NatsConnection;
pub use error::Error;
pub use subscription::{NatsSubscription, NatsSubscriptionOptions};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::Event;
use async_trait::async_trait;
use harbor_bus::{ConnectOptions, ConnectionLost, ConnectionLostHandler, Connector};
use tracing::{debug, info, warn};

/// Options for [`NatsConnector`].
#[derive(Clone, Debug, Default)]
pub struct NatsConnectorOptions {
    /// How long a single connection attempt may take.
    pub connection_timeout: Option<Duration>,
}

/// Opens connections to a NATS server.
#[derive(Clone, Debug, Default)]
pub struct NatsConnector {
    connection_timeout: Option<Duration>,
}

impl NatsConnector {
    /// Creates a new connector.
    #[must_use]
    pub fn new(NatsConnectorOptions { connection_timeout }: NatsConnectorOptions) -> Self {
        Self { connection_timeout }
    }
}

/// Link status shared between a connection and its event callback.
pub(crate) struct Link {
    connected: AtomicBool,
    closing: AtomicBool,
    lost: AtomicBool,
    connection_lost: Option<ConnectionLostHandler>,
}

impl Link {
    fn new(connection_lost: Option<ConnectionLostHandler>) -> Self {
        Self {
            connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            lost: AtomicBool::new(false),
            connection_lost,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    fn on_event(&self, event: Event) {
        match event {
            Event::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                debug!("connected to NATS server");
            }
            Event::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);

                if self.closing.load(Ordering::SeqCst) || self.lost.swap(true, Ordering::SeqCst) {
                    return;
                }

                warn!("disconnected from NATS server");
                if let Some(connection_lost) = &self.connection_lost {
                    connection_lost(ConnectionLost::new("disconnected from NATS server"));
                }
            }
            other => debug!(event = %other, "NATS client event"),
        }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Error = Error;
    type Connection = NatsConnection;

    async fn connect(&self, options: ConnectOptions) -> Result<Self::Connection, Self::Error> {
        let link = Arc::new(Link::new(options.connection_lost.clone()));

        let mut connect_options = async_nats::ConnectOptions::new()
            .name(format!("{}:{}", options.cluster_id, options.client_id))
            .ping_interval(options.ping_interval)
            .event_callback({
                let link = link.clone();
                move |event| {
                    let link = link.clone();
                    async move { link.on_event(event) }
                }
            });

        if let Some(timeout) = self.connection_timeout {
            connect_options = connect_options.connection_timeout(timeout);
        }

        // async-nats has no equivalent of max_pings_out
        debug!(max_pings_out = options.max_pings_out, "ignoring max_pings_out");

        let client = async_nats::connect_with_options(options.urls.join(","), connect_options)
            .await
            .map_err(|e| Error::Connect(e.kind()))?;
        link.connected.store(true, Ordering::SeqCst);

        info!(urls = ?options.urls, client_id = %options.client_id, "connected to NATS");

        Ok(NatsConnection::new(client, link))
    }
}
