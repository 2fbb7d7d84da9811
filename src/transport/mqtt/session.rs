//! MQTT session persistence
//!
//! One binary file per client ID under a caller-chosen directory,
//! carrying the subscription list, the allocator position, and the
//! in-flight window, so sessions survive reconnects and process restarts.
//!
//! File layout (all integers big-endian):
//!
//! ```text
//! magic(u32=0x4D435053 "MCPS") | version(u16)
//! created_ms(u64) | last_access_ms(u64) | expiry_secs(u32)
//! id_len(u16) client_id[id_len]
//! sub_count(u16) { topic_len(u16) topic[] qos(i32) }*
//! last_packet_id(u16)
//! inflight_count(u16) { packet_id(u16) topic_len(u16) topic[]
//!                       payload_len(u32) payload[] qos(i32) retain(i32)
//!                       sent_ms(u64) retry(u32) }*
//! ```
//!
//! Files with a mismatched magic or a higher format version are rejected
//! and deleted. All file I/O is serialized by one mutex and guarded by a
//! shutdown flag.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::sync::CancellationToken;

use crate::error::{McpgateError, Result};

/// `"MCPS"` as a big-endian u32.
pub const SESSION_MAGIC: u32 = 0x4D43_5053;

/// Current file-format version.
pub const SESSION_FORMAT_VERSION: u16 = 1;

/// One persisted in-flight publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedInflight {
    pub packet_id: u16,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: i32,
    pub retain: bool,
    pub sent_ms: u64,
    pub retry: u32,
}

/// Everything a client session persists across restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub client_id: String,
    pub created_ms: u64,
    pub last_access_ms: u64,
    pub expiry_secs: u32,
    /// `(topic, qos)` pairs, in subscription order.
    pub subscriptions: Vec<(String, i32)>,
    pub last_packet_id: u16,
    pub inflight: Vec<PersistedInflight>,
}

impl SessionState {
    /// Serialize into the documented binary layout.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u32(SESSION_MAGIC);
        buf.put_u16(SESSION_FORMAT_VERSION);
        buf.put_u64(self.created_ms);
        buf.put_u64(self.last_access_ms);
        buf.put_u32(self.expiry_secs);

        buf.put_u16(self.client_id.len() as u16);
        buf.put_slice(self.client_id.as_bytes());

        buf.put_u16(self.subscriptions.len() as u16);
        for (topic, qos) in &self.subscriptions {
            buf.put_u16(topic.len() as u16);
            buf.put_slice(topic.as_bytes());
            buf.put_i32(*qos);
        }

        buf.put_u16(self.last_packet_id);

        buf.put_u16(self.inflight.len() as u16);
        for message in &self.inflight {
            buf.put_u16(message.packet_id);
            buf.put_u16(message.topic.len() as u16);
            buf.put_slice(message.topic.as_bytes());
            buf.put_u32(message.payload.len() as u32);
            buf.put_slice(&message.payload);
            buf.put_i32(message.qos);
            buf.put_i32(i32::from(message.retain));
            buf.put_u64(message.sent_ms);
            buf.put_u32(message.retry);
        }

        buf.freeze()
    }

    /// Parse the documented binary layout.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Parse`] for truncated data, a wrong magic, or a
    /// newer format version.
    pub fn decode(mut data: &[u8]) -> Result<SessionState> {
        ensure_remaining(data, 6, "header")?;
        let magic = data.get_u32();
        if magic != SESSION_MAGIC {
            return Err(
                McpgateError::Parse(format!("session file magic {magic:#010x} mismatch")).into(),
            );
        }
        let version = data.get_u16();
        if version > SESSION_FORMAT_VERSION {
            return Err(McpgateError::Parse(format!(
                "session file version {version} is newer than supported {SESSION_FORMAT_VERSION}"
            ))
            .into());
        }

        ensure_remaining(data, 8 + 8 + 4 + 2, "timestamps")?;
        let created_ms = data.get_u64();
        let last_access_ms = data.get_u64();
        let expiry_secs = data.get_u32();

        let client_id = get_string(&mut data, "client id")?;

        ensure_remaining(data, 2, "subscription count")?;
        let sub_count = data.get_u16();
        let mut subscriptions = Vec::with_capacity(sub_count as usize);
        for _ in 0..sub_count {
            let topic = get_string(&mut data, "subscription topic")?;
            ensure_remaining(data, 4, "subscription qos")?;
            subscriptions.push((topic, data.get_i32()));
        }

        ensure_remaining(data, 2 + 2, "packet id")?;
        let last_packet_id = data.get_u16();

        let inflight_count = data.get_u16();
        let mut inflight = Vec::with_capacity(inflight_count as usize);
        for _ in 0..inflight_count {
            ensure_remaining(data, 2, "inflight packet id")?;
            let packet_id = data.get_u16();
            let topic = get_string(&mut data, "inflight topic")?;
            ensure_remaining(data, 4, "inflight payload length")?;
            let payload_len = data.get_u32() as usize;
            ensure_remaining(data, payload_len, "inflight payload")?;
            let payload = data[..payload_len].to_vec();
            data.advance(payload_len);
            ensure_remaining(data, 4 + 4 + 8 + 4, "inflight trailer")?;
            let qos = data.get_i32();
            let retain = data.get_i32() != 0;
            let sent_ms = data.get_u64();
            let retry = data.get_u32();
            inflight.push(PersistedInflight {
                packet_id,
                topic,
                payload,
                qos,
                retain,
                sent_ms,
                retry,
            });
        }

        Ok(SessionState {
            client_id,
            created_ms,
            last_access_ms,
            expiry_secs,
            subscriptions,
            last_packet_id,
            inflight,
        })
    }
}

fn ensure_remaining(data: &[u8], needed: usize, what: &str) -> Result<()> {
    if data.len() < needed {
        return Err(McpgateError::Parse(format!("session file truncated at {what}")).into());
    }
    Ok(())
}

fn get_string(data: &mut &[u8], what: &str) -> Result<String> {
    ensure_remaining(*data, 2, what)?;
    let len = data.get_u16() as usize;
    ensure_remaining(*data, len, what)?;
    let value = std::str::from_utf8(&data[..len])
        .map_err(|_| McpgateError::Parse(format!("session file has non-UTF-8 {what}")))?
        .to_string();
    data.advance(len);
    Ok(value)
}

/// File-per-client session store rooted at a storage directory.
///
/// # Examples
///
/// ```no_run
/// use mcpgate::transport::mqtt::session::SessionStore;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let store = SessionStore::new("/var/lib/mcpgate/sessions");
/// let loaded = store.load("client-1").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SessionStore {
    dir: PathBuf,
    /// Serializes all file I/O for this store.
    io: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

impl SessionStore {
    /// Store rooted at `dir` (created on first save).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            io: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Refuse further file I/O.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn path_for(&self, client_id: &str) -> PathBuf {
        // Client IDs may contain separator characters; flatten them so
        // every session stays inside the storage directory.
        let safe: String = client_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.session"))
    }

    /// Persist `state`, stamping `last_access_ms` with the current time.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Shutdown`] after [`shutdown`](Self::shutdown), and
    /// [`McpgateError::Io`] for filesystem failures.
    pub async fn save(&self, state: &SessionState) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpgateError::Shutdown("session store closed".to_string()).into());
        }
        let _io = self.io.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut stamped = state.clone();
        stamped.last_access_ms = unix_millis();
        let path = self.path_for(&state.client_id);
        tokio::fs::write(&path, stamped.encode()).await?;
        tracing::trace!(path = %path.display(), "session saved");
        Ok(())
    }

    /// Load the session for `client_id`.
    ///
    /// Missing files yield `Ok(None)`. A file with a mismatched magic or
    /// newer version is deleted and also yields `Ok(None)`.
    pub async fn load(&self, client_id: &str) -> Result<Option<SessionState>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(McpgateError::Shutdown("session store closed".to_string()).into());
        }
        let _io = self.io.lock().await;
        let path = self.path_for(client_id);

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match SessionState::decode(&data) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "rejecting unreadable session file"
                );
                let _ = tokio::fs::remove_file(&path).await;
                Ok(None)
            }
        }
    }

    /// Remove the session file for `client_id`, if present.
    pub async fn delete(&self, client_id: &str) -> Result<()> {
        let _io = self.io.lock().await;
        let path = self.path_for(client_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete files whose elapsed-since-last-access exceeds their expiry
    /// interval. Returns the number removed.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(0);
        }
        let _io = self.io.lock().await;
        let mut removed = 0usize;
        let now = unix_millis();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("session") {
                continue;
            }
            if session_file_expired(&path, now).await {
                if tokio::fs::remove_file(&path).await.is_ok() {
                    tracing::debug!(path = %path.display(), "expired session removed");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Spawn the periodic cleanup task; exits when `cancel` fires.
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = store.cleanup_expired().await {
                    tracing::warn!(error = %e, "session cleanup pass failed");
                }
            }
        })
    }
}

async fn session_file_expired(path: &Path, now_ms: u64) -> bool {
    let Ok(data) = tokio::fs::read(path).await else {
        return false;
    };
    let Ok(state) = SessionState::decode(&data) else {
        // Unreadable files are reclaimed too.
        return true;
    };
    let expiry_ms = u64::from(state.expiry_secs) * 1000;
    expiry_ms > 0 && now_ms.saturating_sub(state.last_access_ms) > expiry_ms
}

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> SessionState {
        SessionState {
            client_id: "client-7".to_string(),
            created_ms: 1_700_000_000_000,
            last_access_ms: 1_700_000_001_000,
            expiry_secs: 3600,
            subscriptions: vec![
                ("mcp/response/client-7".to_string(), 1),
                ("mcp/notification/client-7".to_string(), 0),
            ],
            last_packet_id: 41,
            inflight: vec![PersistedInflight {
                packet_id: 41,
                topic: "mcp/request/client-7".to_string(),
                payload: br#"{"jsonrpc":"2.0","id":3,"method":"ping"}"#.to_vec(),
                qos: 1,
                retain: false,
                sent_ms: 1_700_000_000_500,
                retry: 2,
            }],
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let state = sample_state();
        let decoded = SessionState::decode(&state.encode()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_roundtrip_empty_lists() {
        let state = SessionState {
            client_id: "c".to_string(),
            created_ms: 0,
            last_access_ms: 0,
            expiry_secs: 0,
            subscriptions: Vec::new(),
            last_packet_id: 0,
            inflight: Vec::new(),
        };
        assert_eq!(SessionState::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn test_magic_starts_the_file() {
        let encoded = sample_state().encode();
        assert_eq!(&encoded[..4], b"MCPS");
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = sample_state().encode().to_vec();
        encoded[0] = b'X';
        let err = SessionState::decode(&encoded).unwrap_err();
        assert!(matches!(
            crate::error::as_mcpgate_error(&err),
            Some(McpgateError::Parse(_))
        ));
    }

    #[test]
    fn test_newer_version_rejected() {
        let mut encoded = sample_state().encode().to_vec();
        // Bump the version field (bytes 4..6) past the supported one.
        encoded[5] = SESSION_FORMAT_VERSION as u8 + 1;
        assert!(SessionState::decode(&encoded).is_err());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let encoded = sample_state().encode();
        for cut in [0, 4, 10, encoded.len() / 2, encoded.len() - 1] {
            assert!(
                SessionState::decode(&encoded[..cut]).is_err(),
                "truncation at {cut} must fail"
            );
        }
    }

    #[tokio::test]
    async fn test_store_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let state = sample_state();

        store.save(&state).await.unwrap();
        let loaded = store.load(&state.client_id).await.unwrap().unwrap();

        // `save` refreshes last_access_ms; everything else is identical.
        assert_eq!(loaded.client_id, state.client_id);
        assert_eq!(loaded.subscriptions, state.subscriptions);
        assert_eq!(loaded.last_packet_id, state.last_packet_id);
        assert_eq!(loaded.inflight, state.inflight);
        assert!(loaded.last_access_ms >= state.last_access_ms);
    }

    #[tokio::test]
    async fn test_store_load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_deletes_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let path = dir.path().join("broken.session");
        tokio::fs::write(&path, b"XXXXgarbage").await.unwrap();

        assert!(store.load("broken").await.unwrap().is_none());
        assert!(!path.exists(), "corrupt session file must be deleted");
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut stale = sample_state();
        stale.client_id = "stale".to_string();
        stale.expiry_secs = 1;
        // Write directly so last_access_ms stays in the distant past.
        tokio::fs::create_dir_all(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("stale.session"), stale.encode())
            .await
            .unwrap();

        let mut fresh = sample_state();
        fresh.client_id = "fresh".to_string();
        store.save(&fresh).await.unwrap();

        let removed = store.cleanup_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("fresh").await.unwrap().is_some());
        assert!(store.load("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_blocks_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.shutdown();
        let err = store.save(&sample_state()).await.unwrap_err();
        assert!(crate::error::as_mcpgate_error(&err).unwrap().is_shutdown());
    }
}
