use std::error::Error;
use std::fmt::{self, Display};

/// How a bus failure should be treated by callers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FailureKind {
    /// The connection is not usable right now (closed, draining, not yet established).
    State,

    /// The transport was interrupted while the operation was in flight.
    Network,

    /// The bus did not answer in time.
    Timeout,

    /// The request itself was rejected (bad subject, oversized payload, ...).
    Protocol,
}

impl FailureKind {
    /// Whether the failure is network-class, i.e. expected to go away once
    /// connectivity is restored.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::State | Self::Network)
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::Network => write!(f, "network"),
            Self::Timeout => write!(f, "timeout"),
            Self::Protocol => write!(f, "protocol"),
        }
    }
}

/// Marker trait for bus errors.
pub trait BusError: Error + Send + Sync + 'static {
    /// Classifies the failure.
    fn kind(&self) -> FailureKind;

    /// Shorthand for `self.kind().is_transient()`.
    fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_state_and_network_are_transient() {
        assert!(FailureKind::State.is_transient());
        assert!(FailureKind::Network.is_transient());
        assert!(!FailureKind::Timeout.is_transient());
        assert!(!FailureKind::Protocol.is_transient());
    }
}
