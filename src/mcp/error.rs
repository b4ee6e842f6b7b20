//! Error taxonomy for the session runtime.
//!
//! Every failure carries a stable [`ErrorKind`] so callers (and the CLI exit
//! code mapping) never have to parse messages.

use crate::mcp::capabilities::Capability;
use crate::mcp::client::state::SessionState;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// JSON-RPC code for an unknown or declined method.
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for invalid parameters.
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
/// JSON-RPC code for an internal failure while serving a request.
pub const JSONRPC_INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum McpError {
    /// The endpoint could not be reached or the server process could not start.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The transport went away after the session was established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("server did not negotiate the {capability} capability required by {method}")]
    Unsupported {
        capability: Capability,
        method: String,
    },

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        state: SessionState,
        operation: String,
    },

    #[error("unexpected payload for {method}: {detail}")]
    UnexpectedPayload { method: String, detail: String },

    /// The server answered with a JSON-RPC error object.
    #[error("server returned error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("{method} timed out after {}ms", .after.as_millis())]
    Timeout { method: String, after: Duration },

    #[error("call cancelled: {0}")]
    Cancelled(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

/// Stable machine-readable identifier for an [`McpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    ConnectionLost,
    HandshakeRejected,
    MalformedFrame,
    Unsupported,
    InvalidState,
    UnexpectedPayload,
    Remote,
    Timeout,
    Cancelled,
    Configuration,
}

/// Coarse grouping used for propagation policy and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Connection,
    Protocol,
    Call,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection_failed",
            ErrorKind::ConnectionLost => "connection_lost",
            ErrorKind::HandshakeRejected => "handshake_rejected",
            ErrorKind::MalformedFrame => "malformed_frame",
            ErrorKind::Unsupported => "unsupported_capability",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::UnexpectedPayload => "unexpected_payload",
            ErrorKind::Remote => "remote_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Configuration => "invalid_configuration",
        }
    }

    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorKind::Connection | ErrorKind::ConnectionLost => ErrorCategory::Connection,
            ErrorKind::HandshakeRejected
            | ErrorKind::MalformedFrame
            | ErrorKind::Unsupported
            | ErrorKind::InvalidState
            | ErrorKind::UnexpectedPayload => ErrorCategory::Protocol,
            ErrorKind::Remote | ErrorKind::Timeout | ErrorKind::Cancelled => ErrorCategory::Call,
            ErrorKind::Configuration => ErrorCategory::Configuration,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Connection(_) => ErrorKind::Connection,
            McpError::ConnectionLost(_) => ErrorKind::ConnectionLost,
            McpError::HandshakeRejected(_) => ErrorKind::HandshakeRejected,
            McpError::MalformedFrame(_) => ErrorKind::MalformedFrame,
            McpError::Unsupported { .. } => ErrorKind::Unsupported,
            McpError::InvalidState { .. } => ErrorKind::InvalidState,
            McpError::UnexpectedPayload { .. } => ErrorKind::UnexpectedPayload,
            McpError::Remote { .. } => ErrorKind::Remote,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::Cancelled(_) => ErrorKind::Cancelled,
            McpError::Configuration(_) => ErrorKind::Configuration,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind().category()
    }

    /// Errors that end the session for every current and future caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::ConnectionLost | ErrorKind::HandshakeRejected
        )
    }

    pub(crate) fn unexpected(method: &str, detail: impl fmt::Display) -> Self {
        McpError::UnexpectedPayload {
            method: method.to_string(),
            detail: detail.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_categories() {
        let lost = McpError::ConnectionLost("eof".to_string());
        assert_eq!(lost.kind().as_str(), "connection_lost");
        assert_eq!(lost.category(), ErrorCategory::Connection);
        assert!(lost.is_fatal());

        let timeout = McpError::Timeout {
            method: "tools/call".to_string(),
            after: Duration::from_millis(250),
        };
        assert_eq!(timeout.category(), ErrorCategory::Call);
        assert!(!timeout.is_fatal());
        assert_eq!(timeout.to_string(), "tools/call timed out after 250ms");
    }

    #[test]
    fn unsupported_names_capability_and_method() {
        let err = McpError::Unsupported {
            capability: Capability::Resources,
            method: "resources/list".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::Protocol);
        assert_eq!(
            err.to_string(),
            "server did not negotiate the resources capability required by resources/list"
        );
    }
}
