//! Error taxonomy shared by every component.
//!
//! Errors are returned as values to the immediate caller; nothing crosses a
//! thread boundary implicitly. An idle receive surfaces as `Timeout` and is
//! part of normal operation, not a fault.

use thiserror::Error;

/// Errors produced by the negotiation daemon.
#[derive(Debug, Error)]
pub enum NegotioError {
    /// A bounded wait elapsed without data.
    #[error("timed out")]
    Timeout,

    /// Malformed packet, unknown type, short payload, or zero policy id.
    #[error("invalid parameter")]
    InvalidParameter,

    /// A handshake could not be completed (e.g. session expired).
    #[error("negotiation failed")]
    NegotiationFailed,

    /// Memory or entropy resource unavailable (RNG failure).
    #[error("memory or resource error")]
    MemoryOrResource,

    /// Send/recv syscall failure on a socket.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NegotioError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(NegotioError::Timeout.to_string(), "timed out");
        assert_eq!(
            NegotioError::InvalidParameter.to_string(),
            "invalid parameter"
        );
        assert_eq!(
            NegotioError::NegotiationFailed.to_string(),
            "negotiation failed"
        );
    }

    #[test]
    fn io_error_converts_to_socket() {
        let io = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        let err: NegotioError = io.into();
        assert!(matches!(err, NegotioError::Socket(_)));
    }
}
