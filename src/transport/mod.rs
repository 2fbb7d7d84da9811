//! MCP transport abstraction and implementations
//!
//! This module defines the [`Transport`] trait that all client transport
//! implementations satisfy. Concrete implementations live in submodules:
//!
//! - [`http::HttpTransport`] -- Streamable HTTP/SSE transport conforming
//!   to MCP protocol revision `2025-03-26`.
//! - [`mqtt::MqttTransport`] -- broker-based transport with QoS tracking,
//!   persistent sessions, and automatic reconnection.
//!
//! # Design
//!
//! The trait is intentionally minimal: callers `send` a serialized
//! JSON-RPC string and `receive` a stream of serialized JSON-RPC strings
//! (one per logical message). Framing, session management, and
//! reconnection are the responsibility of each concrete implementation.
//! Request/response pairing happens one layer up, in
//! [`crate::client::McpClient`], against the pending-request registry.

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;

use crate::error::Result;

pub mod http;
pub mod mqtt;

/// Connection lifecycle of a transport.
///
/// Transitions are reported through the optional state callback exactly
/// once per transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connection activity.
    Disconnected,
    /// A connection or stream is being established.
    Connecting,
    /// The request path is usable.
    Connected,
    /// The request path is usable and a server event stream is attached.
    SseConnected,
    /// The last operation failed; a reconnect may be scheduled.
    Error,
}

/// Callback invoked on every transport state transition.
pub type StateCallback = std::sync::Arc<dyn Fn(TransportState) + Send + Sync>;

/// Abstraction over MCP client transports.
///
/// All methods are `async` or return pinned [`Stream`]s so implementations
/// can drive I/O without blocking the executor. Synchronous receive is
/// deliberately absent: inbound traffic is consumed through the stream by
/// a dispatcher task.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Send a complete serialized JSON-RPC message to the remote peer.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::McpgateError::Transport`] when the
    /// underlying I/O fails, and [`crate::error::McpgateError::Shutdown`]
    /// after [`close`](Self::close).
    async fn send(&self, message: String) -> Result<()>;

    /// Stream of inbound serialized JSON-RPC messages, in arrival order.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>>;

    /// Tear the transport down: stop worker tasks and release resources.
    /// Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Reconnect delay for attempt `failures`: `base * 2^failures`, capped,
/// with ±25% jitter. Shared by the SSE reconnector and the MQTT client.
pub(crate) fn backoff_delay(base: Duration, failures: u32, cap: Duration) -> Duration {
    use rand::Rng;

    let exp = failures.min(16);
    let raw = base.saturating_mul(1u32 << exp).min(cap);
    let jitter: f64 = rand::rng().random_range(0.75..=1.25);
    let jittered = raw.as_secs_f64() * jitter;
    Duration::from_secs_f64(jittered.min(cap.as_secs_f64()))
}
