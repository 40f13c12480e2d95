//! Error types for vrswatch.
//!
//! All errors are strongly typed using thiserror. Transport and decode
//! failures are leaf enums that compose into [`WatchError`], the error
//! returned by every public operation.

use thiserror::Error;

/// Errors raised by a transport session (socket, JSON-RPC, in-memory).
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
    },

    #[error("Server rejected '{method}': {message}")]
    Rpc {
        method: String,
        message: String,
    },

    #[error("Request '{method}' timed out after {duration_ms}ms")]
    Timeout {
        method: String,
        duration_ms: u64,
    },

    #[error("Session is disconnected")]
    Disconnected,
}

/// Errors decoding dynamically typed row data.
#[allow(missing_docs)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Column '{column}' expected {expected}, found {found}")]
    UnexpectedType {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Malformed OVSDB value: {reason}")]
    Malformed {
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Top-level error type for vrswatch.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Connect error: {0}")]
    Connect(#[from] TransportError),

    #[error("Table '{table}' not found in schema of database '{database}'")]
    SchemaMissing {
        database: String,
        table: String,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Monitor request for table '{table}' rejected: {message}")]
    Subscription {
        table: String,
        message: String,
    },

    #[error("Disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        reason: String,
    },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl WatchError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub(crate) fn disconnected(path: impl Into<String>) -> Self {
        Self::Disconnected { path: path.into() }
    }

    /// Returns true if this is a connection-level error.
    #[must_use]
    pub const fn is_connect(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Returns true if the requested table is absent from the server schema.
    #[must_use]
    pub const fn is_schema_missing(&self) -> bool {
        matches!(self, Self::SchemaMissing { .. })
    }

    /// Returns true if retrying the same call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(e) => !matches!(e, TransportError::Rpc { .. } | TransportError::Protocol { .. }),
            Self::Disconnected { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Result type alias for vrswatch operations.
pub type WatchResult<T> = Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_missing_message() {
        let err = WatchError::SchemaMissing {
            database: "Open_vSwitch".to_string(),
            table: "Nope".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("Nope"));
        assert!(msg.contains("Open_vSwitch"));
        assert!(err.is_schema_missing());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_decode_error_message() {
        let err = DecodeError::UnexpectedType {
            column: "ip_addr".to_string(),
            expected: "string",
            found: "integer",
        };
        let msg = format!("{err}");
        assert!(msg.contains("ip_addr"));
        assert!(msg.contains("integer"));
    }

    #[test]
    fn test_watch_error_from_transport() {
        let err: WatchError = TransportError::ConnectionFailed {
            message: "refused".to_string(),
        }
        .into();
        assert!(err.is_connect());
        assert!(err.is_retryable());
        assert!(format!("{err}").contains("refused"));
    }

    #[test]
    fn test_rpc_rejection_not_retryable() {
        let err: WatchError = TransportError::Rpc {
            method: "monitor".to_string(),
            message: "unknown database".to_string(),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_watch_error_retryable() {
        assert!(WatchError::Timeout { duration_ms: 10 }.is_retryable());
        assert!(WatchError::disconnected("session").is_retryable());
        assert!(!WatchError::Cancelled.is_retryable());
        assert!(!WatchError::internal("boom").is_retryable());
    }
}
