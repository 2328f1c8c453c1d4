//! Transport layer error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Server host could not be resolved.
    #[error("host not found: {host}")]
    HostNotFound {
        /// Host as configured.
        host: String,
        /// Resolver error, if the resolver reported one.
        #[source]
        source: Option<io::Error>,
    },

    /// Every connect attempt failed.
    #[error("cannot connect to {addr} after {attempts} attempts")]
    RetriesExhausted {
        /// Target as `host:port`.
        addr: String,
        /// Attempts made.
        attempts: u32,
    },

    /// No open socket.
    #[error("not connected")]
    NotConnected,

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A write did not finish in time; the socket was dropped.
    #[error("send timed out after {after:?}")]
    SendTimeout {
        /// Configured bound.
        after: Duration,
    },

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Check if this error is a connect-time failure.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            TransportError::HostNotFound { .. } | TransportError::RetriesExhausted { .. }
        )
    }

    /// Check if this error means the socket is gone.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransportError::NotConnected
                | TransportError::ConnectionClosed
                | TransportError::SendTimeout { .. }
                | TransportError::Io(_)
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failures() {
        assert!(TransportError::HostNotFound {
            host: "noserver.invalid".into(),
            source: None
        }
        .is_connect_failure());
        assert!(TransportError::RetriesExhausted {
            addr: "127.0.0.1:1".into(),
            attempts: 4
        }
        .is_connect_failure());

        assert!(!TransportError::NotConnected.is_connect_failure());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(TransportError::NotConnected.is_fatal());
        assert!(TransportError::ConnectionClosed.is_fatal());
        assert!(TransportError::SendTimeout {
            after: Duration::from_secs(3)
        }
        .is_fatal());
        assert!(TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "test")).is_fatal());

        assert!(!TransportError::RetriesExhausted {
            addr: "127.0.0.1:1".into(),
            attempts: 4
        }
        .is_fatal());
    }
}
