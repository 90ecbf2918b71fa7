//! Crate-wide error type.
//!
//! Every fallible transport operation returns [`NetError`]. TLS failures are
//! carried unchanged inside [`NetError::Tls`] so callers can match on the
//! exact handshake stage that failed.

use thiserror::Error;

use crate::tls::TlsError;

/// Errors returned by sockets, the packet pool and the network manager.
#[derive(Debug, Error)]
pub enum NetError {
    /// The operation did not complete before its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The interface link is down; no transport operation is attempted.
    #[error("network link is down")]
    LinkDown,

    /// Generic failure with context.
    #[error("operation failed: {0}")]
    Failed(String),

    /// The request is valid but not supported (e.g. IPv6 ping).
    #[error("operation not supported")]
    Unsupported,

    /// No packet buffer could be taken from the pool without waiting.
    #[error("packet pool exhausted")]
    OutOfMemory,

    /// A bounded registry has no free slot.
    #[error("{registry} is full (capacity {capacity})")]
    CapacityExceeded {
        registry: &'static str,
        capacity: usize,
    },

    /// Caller passed an argument the operation cannot use.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// TLS record or handshake failure.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl NetError {
    /// Shorthand for [`NetError::Failed`].
    pub fn failed(context: impl Into<String>) -> Self {
        NetError::Failed(context.into())
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NetError::Timeout | NetError::LinkDown | NetError::OutOfMemory
        )
    }

    /// The TLS error, if this is one.
    pub fn tls(&self) -> Option<TlsError> {
        match self {
            NetError::Tls(e) => Some(*e),
            _ => None,
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(NetError::Timeout.is_retryable());
        assert!(NetError::LinkDown.is_retryable());
        assert!(!NetError::Unsupported.is_retryable());
        assert!(!NetError::Tls(TlsError::InvalidMac).is_retryable());
    }

    #[test]
    fn tls_errors_convert() {
        let err: NetError = TlsError::PeerVerifyFailed.into();
        assert_eq!(err.tls(), Some(TlsError::PeerVerifyFailed));
        assert!(err.to_string().contains("peer certificate"));
    }

    #[test]
    fn capacity_message_names_registry() {
        let err = NetError::CapacityExceeded {
            registry: "socket callback table",
            capacity: 5,
        };
        assert_eq!(err.to_string(), "socket callback table is full (capacity 5)");
    }
}
