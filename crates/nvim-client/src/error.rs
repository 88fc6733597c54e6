//! Error types for the neovim client.

use nvim_rpc::RpcError;
use rmpv::Value;
use thiserror::Error;

/// Main error type for client calls.
///
/// `Clone` because a connection failure settles every queued call with
/// the same error.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Transport-level failure: closed connection, timeout, remote error.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The API discovery call failed or returned a malformed table.
    #[error("API bootstrap failed: {message}")]
    BootstrapFailure { message: String },

    /// The remote API table has no method with this name.
    #[error("Method not found: {name}")]
    MethodNotFound { name: String },

    #[error("Wrong number of arguments for {method}: expected {expected}, got {actual}")]
    ArityMismatch {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// The call succeeded but its result has an unexpected shape.
    #[error("Unexpected result from {method}: {message}")]
    UnexpectedResult { method: String, message: String },
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    pub fn bootstrap(message: impl Into<String>) -> Self {
        ClientError::BootstrapFailure {
            message: message.into(),
        }
    }

    pub fn unexpected(method: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::UnexpectedResult {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Whether the connection is gone (or never became usable).
    pub fn is_connection_error(&self) -> bool {
        match self {
            ClientError::Rpc(e) => e.is_connection_error(),
            ClientError::BootstrapFailure { .. } => true,
            _ => false,
        }
    }

    /// Check if re-issuing the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Rpc(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The editor's error payload, if the editor rejected the call.
    pub fn remote_payload(&self) -> Option<&Value> {
        match self {
            ClientError::Rpc(e) => e.remote_payload(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = ClientError::ArityMismatch {
            method: "buffer_get_line".into(),
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "Wrong number of arguments for buffer_get_line: expected 2, got 1"
        );

        let err = ClientError::from(RpcError::ConnectionClosed {
            reason: "connection closed by peer".into(),
        });
        assert_eq!(err.to_string(), "Connection closed: connection closed by peer");
    }

    #[test]
    fn test_connection_errors() {
        assert!(ClientError::bootstrap("bad table").is_connection_error());
        assert!(!ClientError::MethodNotFound { name: "x".into() }.is_connection_error());
        assert!(ClientError::from(RpcError::Timeout(Duration::from_secs(1))).is_retryable());
    }

    #[test]
    fn test_remote_payload_passes_through() {
        let err = ClientError::from(RpcError::Remote(Value::from("E121")));
        assert_eq!(err.remote_payload(), Some(&Value::from("E121")));
        assert!(ClientError::bootstrap("x").remote_payload().is_none());
    }
}
