//! Request forwarding over pooled backend connections
//!
//! One forward = borrow a connection, length-prefixed send, length-
//! prefixed receive, release. The backend's timeout bounds the whole
//! exchange: borrowing eats into the same budget as the I/O. A connection
//! that saw an I/O failure is released as invalid so the pool closes it
//! instead of lending it out again.

use bytes::Bytes;
use tokio::time::Instant;

use crate::codec::{Codec, JsonRpcRequest};
use crate::error::{McpgateError, Result};
use crate::framing::{read_frame, write_frame, MAX_MCP_MESSAGE_SIZE};
use crate::gateway::Backend;

/// Forward `request` to `backend` and return the raw response bytes.
///
/// # Errors
///
/// Propagates pool borrow failures ([`McpgateError::Timeout`],
/// [`McpgateError::Shutdown`], [`McpgateError::Transport`]), framing and
/// I/O failures as [`McpgateError::Transport`] /
/// [`McpgateError::Parse`], and deadline expiry during the exchange as
/// [`McpgateError::Timeout`].
pub async fn forward(
    backend: &Backend,
    codec: &dyn Codec,
    request: &JsonRpcRequest,
) -> Result<Bytes> {
    let payload = codec.encode_request(request)?;

    let started = Instant::now();
    let mut conn = backend.pool.get(backend.timeout).await?;
    let remaining = backend.timeout.saturating_sub(started.elapsed());

    let exchange = async {
        write_frame(conn.stream_mut(), &payload, None).await?;
        read_frame(conn.stream_mut(), MAX_MCP_MESSAGE_SIZE, None).await
    };

    match tokio::time::timeout(remaining, exchange).await {
        Ok(Ok(response)) => {
            backend.pool.release(conn, true);
            Ok(response)
        }
        Ok(Err(e)) => {
            // The stream may hold half a frame; never reuse it.
            backend.pool.release(conn, false);
            Err(e)
        }
        Err(_elapsed) => {
            backend.pool.release(conn, false);
            Err(McpgateError::Timeout(format!(
                "backend '{}' did not answer within {}ms",
                backend.name,
                backend.timeout.as_millis()
            ))
            .into())
        }
    }
}
