//! Error types for the msgpack-rpc transport.
//!
//! Every failure is delivered to the caller that issued the request. A
//! single stream failure is fanned out to every outstanding call, so the
//! error type is `Clone` and carries messages rather than live sources.

use rmpv::Value;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the transport.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// The stream is closed, or closed while the call was outstanding.
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// No response arrived within the configured per-call timeout.
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// An inbound request named a method with no registered handler.
    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    /// An inbound response carried a sequence id with no pending call.
    #[error("Unexpected response with unrecognized seqid ({seq})")]
    UnmatchedResponse { seq: u32 },

    /// The peer answered with a non-nil error payload.
    #[error("Remote error: {0}")]
    Remote(Value),

    /// Bytes or values that do not form a valid msgpack-rpc message.
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
        }
    }
}

impl From<rmpv::decode::Error> for RpcError {
    fn from(err: rmpv::decode::Error) -> Self {
        RpcError::Protocol {
            message: format!("invalid msgpack data: {}", err),
        }
    }
}

impl RpcError {
    /// Create a protocol error from any message.
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol {
            message: message.into(),
        }
    }

    /// Whether this error means the connection can no longer carry calls.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, RpcError::ConnectionClosed { .. } | RpcError::Io { .. })
    }

    /// Check if re-issuing the same call could succeed.
    ///
    /// Only a timeout leaves the connection usable; everything else is
    /// either terminal for the connection or a definitive answer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Timeout(_))
    }

    /// The peer's error payload, if this is a remote error.
    pub fn remote_payload(&self) -> Option<&Value> {
        match self {
            RpcError::Remote(value) => Some(value),
            _ => None,
        }
    }
}
