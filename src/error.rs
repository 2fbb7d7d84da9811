//! Error types for mcpgate
//!
//! This module defines all error types used throughout the runtime,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for mcpgate operations
///
/// This enum encompasses all possible errors that can occur during
/// request correlation, connection pooling, transport I/O, and gateway
/// forwarding. Variants map one-to-one onto the kinds callers are
/// expected to distinguish: caller contract violations, transport
/// failures, deadline expiry, malformed bytes, routing misses, shutdown
/// races, and invariant violations.
#[derive(Error, Debug)]
pub enum McpgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller contract violated (null required, out-of-range value)
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Transport-level I/O failure, connection closed, or DNS failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request exceeded its per-call deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Bytes received were not a valid message (framing or codec)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Routing or server reported that a resource does not exist
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Routing or server reported that a tool is unavailable
    #[error("Tool unavailable: {0}")]
    ToolUnavailable(String),

    /// Component is shutting down and cannot accept the operation
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Invariant violation (duplicate request ID, table full after resize)
    #[error("Internal error: {0}")]
    Internal(String),

    /// The remote peer returned a JSON-RPC error response
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Human-readable message from the peer
        message: String,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl McpgateError {
    /// True when this error is a per-call deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpgateError::Timeout(_))
    }

    /// True when this error is a shutdown rejection.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, McpgateError::Shutdown(_))
    }
}

/// Result type alias for mcpgate operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Downcast an `anyhow::Error` back to the typed [`McpgateError`], if it is
/// one. Used by callers that branch on the error kind (e.g. the gateway
/// forwarder mapping failures to JSON-RPC error codes).
pub fn as_mcpgate_error(err: &anyhow::Error) -> Option<&McpgateError> {
    err.downcast_ref::<McpgateError>()
}
