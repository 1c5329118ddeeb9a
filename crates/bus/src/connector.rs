use crate::connection::Connection;
use crate::error::BusError;

use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

/// Notification that an established connection was lost.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConnectionLost {
    /// Human readable reason reported by the backend.
    pub cause: String,
}

impl ConnectionLost {
    /// Creates a new notification.
    pub fn new(cause: impl Into<String>) -> Self {
        Self {
            cause: cause.into(),
        }
    }
}

/// Handler the backend calls, from its own task, when a connection is lost.
pub type ConnectionLostHandler = Arc<dyn Fn(ConnectionLost) + Send + Sync + 'static>;

/// Everything a backend needs to open a session.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Identifier of the bus cluster.
    pub cluster_id: String,

    /// Identifier of this client within the cluster.
    pub client_id: String,

    /// Server URLs to try.
    pub urls: Vec<String>,

    /// Interval between keep-alive pings.
    pub ping_interval: Duration,

    /// Number of unanswered pings after which the connection is considered lost.
    pub max_pings_out: u32,

    /// Called at most once per connection when it is lost.
    pub connection_lost: Option<ConnectionLostHandler>,
}

impl Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("cluster_id", &self.cluster_id)
            .field("client_id", &self.client_id)
            .field("urls", &self.urls)
            .field("ping_interval", &self.ping_interval)
            .field("max_pings_out", &self.max_pings_out)
            .field("connection_lost", &self.connection_lost.is_some())
            .finish()
    }
}

/// A trait representing something that can open sessions with the bus.
#[async_trait]
pub trait Connector
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the connector and its connections.
    type Error: BusError;

    /// The connection type produced.
    type Connection: Connection<Error = Self::Error>;

    /// Opens a new connection.
    ///
    /// The `connection_lost` handler in `options` must be invoked if the
    /// returned connection is later lost, but not when it is closed through
    /// [`Connection::close`].
    async fn connect(&self, options: ConnectOptions) -> Result<Self::Connection, Self::Error>;
}
