//! Unified error handling for redshard
//!
//! Transport failures, protocol desyncs, server-side command errors and
//! timeouts are distinct variants so the retry policy can be decided from
//! the error kind alone.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::core::ServerAddress;

/// Main error type for redshard operations
#[derive(Debug, Clone, Error)]
pub enum RedshardError {
    /// Malformed or unexpected byte sequence while decoding replies
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Failure to establish or keep a socket to a server
    #[error("Connection error ({address}): {message}")]
    Connection {
        address: ServerAddress,
        message: String,
    },

    /// The server answered with an error frame
    #[error("Remote error: {0}")]
    Remote(String),

    /// A single-key operation did not receive its reply before the deadline
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// A fan-out operation where some shards did not answer in time
    #[error("Timed out with {} of {} keys unresolved", .missing.len(), .missing.len() + .resolved.len())]
    PartialTimeout {
        resolved: HashMap<Bytes, Option<Bytes>>,
        missing: Vec<Bytes>,
    },

    /// More top-level replies were pulled than commands were written
    #[error("Batch exhausted: only {written} commands were written")]
    BatchExhausted { written: usize },

    /// Server address could not be parsed or is unusable
    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    /// Lookup attempted on a ring without servers
    #[error("Hash ring has no servers")]
    EmptyRing,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration-specific errors
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type alias for redshard operations
pub type RedshardResult<T> = Result<T, RedshardError>;

impl RedshardError {
    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RedshardError::Protocol(message.into())
    }

    /// Create a connection error for a server
    pub fn connection<S: fmt::Display>(address: &ServerAddress, message: S) -> Self {
        RedshardError::Connection {
            address: address.clone(),
            message: message.to_string(),
        }
    }

    /// Create a remote (server-side) error from the raw error payload
    pub fn remote(payload: &[u8]) -> Self {
        RedshardError::Remote(String::from_utf8_lossy(payload).into_owned())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        RedshardError::Timeout {
            operation: operation.into(),
        }
    }

    /// Transport failures are the only kind the client retries on its own
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RedshardError::Connection { .. })
    }

    /// Check if a caller may retry the operation at a higher level
    pub fn is_recoverable(&self) -> bool {
        match self {
            RedshardError::Connection { .. } => true,
            RedshardError::Timeout { .. } => true,
            RedshardError::PartialTimeout { .. } => true,
            _ => false,
        }
    }

    /// Error classes worth reporting with a short label (CLI output, logs)
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedshardError::Protocol(_) => ErrorKind::Protocol,
            RedshardError::Connection { .. } => ErrorKind::Connection,
            RedshardError::Remote(_) => ErrorKind::Remote,
            RedshardError::Timeout { .. } | RedshardError::PartialTimeout { .. } => {
                ErrorKind::Timeout
            }
            _ => ErrorKind::Usage,
        }
    }
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Byte stream desync, the connection was aborted
    Protocol,
    /// Transport failure, retryable
    Connection,
    /// Command rejected by the server, not retryable without fixing input
    Remote,
    /// Ambiguous completion
    Timeout,
    /// Local misuse: bad config, bad address, batch contract violations
    Usage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Protocol => write!(f, "PROTOCOL"),
            ErrorKind::Connection => write!(f, "CONNECTION"),
            ErrorKind::Remote => write!(f, "REMOTE"),
            ErrorKind::Timeout => write!(f, "TIMEOUT"),
            ErrorKind::Usage => write!(f, "USAGE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> ServerAddress {
        ServerAddress::new("127.0.0.1", 6379)
    }

    #[test]
    fn test_error_creation() {
        let error = RedshardError::connection(&addr(), "connection refused");
        assert!(matches!(error, RedshardError::Connection { .. }));
        assert_eq!(
            error.to_string(),
            "Connection error (127.0.0.1:6379): connection refused"
        );
    }

    #[test]
    fn test_remote_error_keeps_payload() {
        let error = RedshardError::remote(b"ERR unknown command 'FOO'");
        assert_eq!(error.to_string(), "Remote error: ERR unknown command 'FOO'");
        assert_eq!(error.kind(), ErrorKind::Remote);
    }

    #[test]
    fn test_error_recoverability() {
        assert!(RedshardError::connection(&addr(), "reset").is_recoverable());
        assert!(RedshardError::connection(&addr(), "reset").is_connection_error());
        assert!(RedshardError::timeout("GET").is_recoverable());
        assert!(!RedshardError::timeout("GET").is_connection_error());
        assert!(!RedshardError::remote(b"ERR syntax").is_recoverable());
        assert!(!RedshardError::protocol("bad marker").is_recoverable());

        let config_error = RedshardError::Config(ConfigError::ValidationError("test".into()));
        assert!(!config_error.is_recoverable());
        assert_eq!(config_error.kind(), ErrorKind::Usage);
    }

    #[test]
    fn test_partial_timeout_message() {
        let mut resolved = HashMap::new();
        resolved.insert(Bytes::from_static(b"a"), Some(Bytes::from_static(b"1")));
        let error = RedshardError::PartialTimeout {
            resolved,
            missing: vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")],
        };
        assert_eq!(error.to_string(), "Timed out with 2 of 3 keys unresolved");
        assert_eq!(error.kind(), ErrorKind::Timeout);
    }
}
