use harbor_bus::BusError;
use thiserror::Error;

/// Errors surfaced by the streaming client.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: BusError,
{
    /// The bus rejected or failed the operation.
    #[error(transparent)]
    Bus(E),

    /// The client has been closed.
    #[error("streaming client is closed")]
    Closed,

    /// No connection is currently established.
    #[error("not connected to the message bus")]
    NotConnected,
}

impl<E> Error<E>
where
    E: BusError,
{
    /// Whether the failure is expected to clear once connectivity returns.
    ///
    /// Safe publishes absorb these failures into the replay cache.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Bus(error) => error.is_transient(),
            Self::Closed => false,
            Self::NotConnected => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use harbor_bus_memory::Error as MemoryError;

    #[test]
    fn test_transience() {
        assert!(Error::<MemoryError>::NotConnected.is_transient());
        assert!(!Error::<MemoryError>::Closed.is_transient());
        assert!(Error::Bus(MemoryError::ConnectionClosed).is_transient());
        assert!(Error::Bus(MemoryError::Unreachable).is_transient());
        assert!(!Error::Bus(MemoryError::InvalidSubject("a.*".to_string())).is_transient());
    }
}
