use harbor_bus::{BusError, FailureKind};
use thiserror::Error;

/// Errors produced by the in-memory bus.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The acknowledgement was lost in transit.
    #[error("acknowledgement interrupted in transit")]
    AckInterrupted,

    /// The broker refused the connection attempt.
    #[error("connection refused by broker")]
    ConnectRefused,

    /// The connection has been closed or severed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// The subject is not valid for the operation.
    #[error("invalid subject: '{0}'")]
    InvalidSubject(String),

    /// The broker rejected the subscription.
    #[error("subscription to '{0}' rejected by broker")]
    SubscriptionRejected(String),

    /// The broker cannot be reached.
    #[error("broker unreachable")]
    Unreachable,
}

impl BusError for Error {
    fn kind(&self) -> FailureKind {
        match self {
            Self::AckInterrupted | Self::ConnectRefused | Self::Unreachable => {
                FailureKind::Network
            }
            Self::ConnectionClosed => FailureKind::State,
            Self::InvalidSubject(_) | Self::SubscriptionRejected(_) => FailureKind::Protocol,
        }
    }
}
