use async_nats::ConnectErrorKind;
use async_nats::jetstream::context::PublishErrorKind;
use harbor_bus::{BusError, FailureKind};
use thiserror::Error;

/// Errors that can occur talking to NATS.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection was closed through `close`.
    #[error("connection is closed")]
    Closed,

    /// Connecting failed.
    #[error("failed to connect: {0}")]
    Connect(ConnectErrorKind),

    /// The operation failed while the client was disconnected from the server.
    #[error("disconnected from server: {0}")]
    Disconnected(String),

    /// Publishing failed.
    #[error("failed to publish: {0}")]
    Publish(PublishErrorKind),

    /// Subscribing failed.
    #[error("failed to subscribe to '{subject}': {reason}")]
    Subscribe {
        /// Subject of the subscription.
        subject: String,

        /// Reason reported by the client.
        reason: String,
    },

    /// Flushing pending messages on close failed.
    #[error("failed to flush on close: {0}")]
    Flush(String),
}

impl BusError for Error {
    fn kind(&self) -> FailureKind {
        match self {
            Self::Closed | Self::Disconnected(_) => FailureKind::State,
            Self::Connect(kind) => match kind {
                ConnectErrorKind::TimedOut => FailureKind::Timeout,
                ConnectErrorKind::Dns | ConnectErrorKind::Io | ConnectErrorKind::MaxReconnects => {
                    FailureKind::Network
                }
                _ => FailureKind::Protocol,
            },
            Self::Publish(kind) => match kind {
                PublishErrorKind::TimedOut => FailureKind::Timeout,
                PublishErrorKind::BrokenPipe => FailureKind::Network,
                _ => FailureKind::Protocol,
            },
            Self::Subscribe { .. } => FailureKind::Protocol,
            Self::Flush(_) => FailureKind::Network,
        }
    }
}
