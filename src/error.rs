use std::fmt;

use thiserror::Error;

use crate::transport::TransportFault;

/// Kind of framing or validation failure reported by a codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Reply does not belong to the request (echo or opcode mismatch)
    IllegalResponse,
    /// Frame checksum does not match its content
    ChecksumMismatch,
    /// Bytes could not be framed or tokenized
    MalformedFrame,
    /// Device answered the request with a NAK
    NotAcknowledged,
}

impl fmt::Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllegalResponse => write!(f, "illegal response"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::MalformedFrame => write!(f, "malformed frame"),
            Self::NotAcknowledged => write!(f, "not acknowledged"),
        }
    }
}

/// Errors produced by a device link and the adapters built on it
#[derive(Error, Debug)]
pub enum LinkError {
    /// Opening the link failed or timed out
    #[error("connection failed: {reason}")]
    Connection {
        /// Why the open attempt failed
        reason: String,
    },

    /// Underlying I/O failure reported by the transport
    #[error("transport error: {0}")]
    Transport(#[from] TransportFault),

    /// Bytes were received but failed codec validation
    #[error("protocol error ({kind}): {detail}")]
    Protocol {
        /// Failure category
        kind: ProtocolErrorKind,
        /// Human readable context
        detail: String,
    },

    /// No valid frame arrived within the command deadline
    #[error("transaction {label} timed out after {timeout_ms}ms")]
    TransactionTimeout {
        /// Log label of the command
        label: String,
        /// Deadline that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Another transaction held the link for longer than the wait budget
    #[error("link busy: {label} not admitted within {busy_timeout_ms}ms")]
    BusyTimeout {
        /// Log label of the command that gave up
        label: String,
        /// Wait budget in milliseconds
        busy_timeout_ms: u64,
    },

    /// Transaction was pending or queued when the link closed
    #[error("transaction cancelled: link closed")]
    Cancelled,

    /// Invalid command parameters
    #[error("invalid command parameters: {0}")]
    InvalidParameters(String),

    /// A framed reply could not be interpreted by the command vocabulary
    #[error("failed to parse response: {0}")]
    Parse(String),
}

/// Result type for link operations
pub type Result<T> = std::result::Result<T, LinkError>;

impl LinkError {
    /// Build a protocol error
    pub fn protocol(kind: ProtocolErrorKind, detail: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            detail: detail.into(),
        }
    }

    /// Build a connection error
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Check if this error indicates a connection-level problem
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Transport(_))
    }

    /// Check if an adapter retry policy may try the command again
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Protocol { .. }
                | Self::TransactionTimeout { .. }
                | Self::BusyTimeout { .. }
        )
    }

    /// Protocol failure kind, if this is a protocol error
    #[must_use]
    pub const fn protocol_kind(&self) -> Option<ProtocolErrorKind> {
        match self {
            Self::Protocol { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = LinkError::connection("timeout");
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_recoverable());

        let transport_error = LinkError::from(TransportFault::Io("broken pipe".to_string()));
        assert!(transport_error.is_connection_error());
        assert!(!transport_error.is_recoverable());

        let timeout_error = LinkError::TransactionTimeout {
            label: "runData".to_string(),
            timeout_ms: 500,
        };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        assert!(!LinkError::Cancelled.is_recoverable());
        assert!(!LinkError::InvalidParameters("gear".to_string()).is_recoverable());
    }

    #[test]
    fn test_protocol_kind() {
        let error = LinkError::protocol(ProtocolErrorKind::ChecksumMismatch, "expected 73, got 74");
        assert_eq!(
            error.protocol_kind(),
            Some(ProtocolErrorKind::ChecksumMismatch)
        );
        assert_eq!(LinkError::Cancelled.protocol_kind(), None);
    }

    #[test]
    fn test_error_display() {
        let error = LinkError::connection("timeout");
        assert_eq!(error.to_string(), "connection failed: timeout");

        let error = LinkError::protocol(ProtocolErrorKind::IllegalResponse, "echo 0x99");
        let error_string = format!("{error}");
        assert!(error_string.contains("illegal response"));
        assert!(error_string.contains("echo 0x99"));
    }
}
