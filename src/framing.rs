//! Length-prefixed message framing over byte streams
//!
//! Pooled gateway connections and the framed TCP frontend exchange
//! messages as a 4-byte unsigned big-endian payload length `L` followed by
//! exactly `L` payload bytes. `L` excludes the prefix itself and must
//! satisfy `0 < L <= max`; a violated bound is a protocol error and the
//! caller is expected to close the connection.
//!
//! Both directions take an optional [`CancellationToken`] checked between
//! I/O operations, so long reads exit promptly when the surrounding
//! component shuts down. Deadlines are the caller's responsibility
//! (`tokio::time::timeout` around the call).

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{McpgateError, Result};

/// Upper bound on a single MCP message payload (16 MiB).
pub const MAX_MCP_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Number of bytes in the length prefix.
const PREFIX_LEN: usize = 4;

/// Write one length-prefixed message.
///
/// The prefix and payload go out as a vectored write of
/// `[length_prefix, payload]`, so the payload is never copied into an
/// intermediate buffer. Partial writes resume mid-slice, and the
/// cancellation flag is checked between syscalls.
///
/// # Errors
///
/// Returns [`McpgateError::InvalidParams`] for an empty or oversized
/// payload, [`McpgateError::Shutdown`] when `cancel` fires mid-write, and
/// [`McpgateError::Transport`] for I/O failures.
pub async fn write_frame<W>(
    writer: &mut W,
    payload: &[u8],
    cancel: Option<&CancellationToken>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(McpgateError::InvalidParams("frame payload is empty".to_string()).into());
    }
    if payload.len() > MAX_MCP_MESSAGE_SIZE {
        return Err(McpgateError::InvalidParams(format!(
            "frame payload {} exceeds maximum {}",
            payload.len(),
            MAX_MCP_MESSAGE_SIZE
        ))
        .into());
    }

    let prefix = (payload.len() as u32).to_be_bytes();
    let total = PREFIX_LEN + payload.len();
    let mut written = 0usize;

    while written < total {
        let write = async {
            if written < PREFIX_LEN {
                let bufs = [IoSlice::new(&prefix[written..]), IoSlice::new(payload)];
                writer.write_vectored(&bufs).await
            } else {
                writer.write(&payload[written - PREFIX_LEN..]).await
            }
        };
        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        return Err(
                            McpgateError::Shutdown("frame write cancelled".to_string()).into()
                        );
                    }
                    r = write => r,
                }
            }
            None => write.await,
        };
        let n =
            result.map_err(|e| McpgateError::Transport(format!("frame write failed: {e}")))?;
        if n == 0 {
            return Err(
                McpgateError::Transport("connection closed during frame write".to_string()).into(),
            );
        }
        written += n;
    }

    writer
        .flush()
        .await
        .map_err(|e| McpgateError::Transport(format!("frame flush failed: {e}")))?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// Reads exactly 4 prefix bytes, validates the declared length against
/// `max_len`, then reads the payload into a freshly allocated buffer.
///
/// # Errors
///
/// Returns [`McpgateError::Transport`] when the stream closes (at a frame
/// boundary or mid-frame), [`McpgateError::Parse`] for a declared length
/// of zero or beyond `max_len`, and [`McpgateError::Shutdown`] when
/// `cancel` fires.
pub async fn read_frame<R>(
    reader: &mut R,
    max_len: usize,
    cancel: Option<&CancellationToken>,
) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    read_exact_cancellable(reader, &mut prefix, cancel, "frame prefix").await?;

    let declared = u32::from_be_bytes(prefix) as usize;
    if declared == 0 {
        return Err(McpgateError::Parse("frame with declared length 0".to_string()).into());
    }
    if declared > max_len {
        return Err(McpgateError::Parse(format!(
            "frame length {declared} exceeds maximum {max_len}"
        ))
        .into());
    }

    let mut payload = vec![0u8; declared];
    read_exact_cancellable(reader, &mut payload, cancel, "frame payload").await?;
    Ok(Bytes::from(payload))
}

/// `read_exact` with cancellation and EOF mapped onto the error taxonomy.
async fn read_exact_cancellable<R>(
    reader: &mut R,
    buf: &mut [u8],
    cancel: Option<&CancellationToken>,
    what: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let read = reader.read_exact(buf);
    let result = match cancel {
        Some(token) => {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err(McpgateError::Shutdown(format!("{what} read cancelled")).into());
                }
                r = read => r,
            }
        }
        None => read.await,
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(McpgateError::Transport(format!("connection closed while reading {what}")).into())
        }
        Err(e) => Err(McpgateError::Transport(format!("{what} read failed: {e}")).into()),
    }
}
