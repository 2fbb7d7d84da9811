//! Streamable HTTP/SSE client transport (MCP `2025-03-26` profile)
//!
//! Every outbound JSON-RPC message is sent as a short-lived HTTP POST.
//! The server may reply with:
//!
//! - `application/json` -- a direct JSON response body
//! - `text/event-stream` -- an SSE stream carrying one or more messages
//! - `202 Accepted` -- an acknowledgement with no body (notifications)
//!
//! An optional GET stream ([`HttpTransport::open_sse_stream`]) lets the
//! server push unsolicited events over a long-lived SSE connection. The
//! stream never blocks the POST path, and it auto-reconnects with jittered
//! exponential backoff when enabled, resuming via `Last-Event-ID`.
//!
//! # Session management
//!
//! When any response carries an `Mcp-Session-Id` header, the stored
//! session ID is atomically replaced and attached to every subsequent
//! request. [`HttpTransport::terminate_session`] issues the profile's
//! DELETE and forgets the session.
//!
//! # State machine
//!
//! `Disconnected -> Connecting -> {Connected, SseConnected, Error}`; the
//! optional state callback fires exactly once per transition.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{McpgateError, Result};
use crate::transport::{backoff_delay, StateCallback, Transport, TransportState};

/// Session header defined by the `2025-03-26` Streamable HTTP profile.
const HEADER_SESSION_ID: &str = "Mcp-Session-Id";

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `id:` field, when present.
    pub id: Option<String>,
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

/// Callback invoked for every event delivered on the GET stream.
pub type SseCallback = Arc<dyn Fn(SseEvent) + Send + Sync>;

/// Configuration for [`HttpTransport`].
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// The MCP endpoint (POST/GET/DELETE target).
    pub endpoint: url::Url,
    /// Bearer token attached as `Authorization` when present.
    pub api_key: Option<String>,
    /// Static extra headers merged into every request.
    pub headers: HashMap<String, String>,
    /// Per-request deadline on the POST path.
    pub request_timeout: Duration,
    /// Reconnect the GET stream automatically after it drops.
    pub sse_auto_reconnect: bool,
    /// Base delay for SSE reconnect backoff.
    pub sse_reconnect_base_delay: Duration,
    /// Backoff cap for SSE reconnects.
    pub sse_reconnect_max_delay: Duration,
}

impl HttpTransportConfig {
    /// Defaults for the given endpoint: 30 s request timeout,
    /// auto-reconnect on, 1 s base delay, 60 s cap.
    pub fn new(endpoint: url::Url) -> Self {
        Self {
            endpoint,
            api_key: None,
            headers: HashMap::new(),
            request_timeout: Duration::from_secs(30),
            sse_auto_reconnect: true,
            sse_reconnect_base_delay: Duration::from_secs(1),
            sse_reconnect_max_delay: Duration::from_secs(60),
        }
    }
}

/// Streamable HTTP/SSE transport.
///
/// # Examples
///
/// ```no_run
/// use mcpgate::transport::http::{HttpTransport, HttpTransportConfig};
///
/// let config =
///     HttpTransportConfig::new(url::Url::parse("http://localhost:3000/mcp").unwrap());
/// let transport = HttpTransport::new(config);
/// ```
pub struct HttpTransport {
    /// Client for short-lived POST/DELETE requests (bounded timeout).
    http_client: Arc<reqwest::Client>,
    /// Client for the long-lived GET stream (no total timeout).
    sse_client: Arc<reqwest::Client>,
    config: HttpTransportConfig,
    /// Active session ID; replaced whenever a response carries the header.
    session_id: Arc<RwLock<Option<String>>>,
    /// Last SSE event ID, used for stream resumption.
    last_event_id: Arc<RwLock<Option<String>>>,
    state: Arc<std::sync::Mutex<TransportState>>,
    state_callback: Arc<std::sync::Mutex<Option<StateCallback>>>,
    sse_callback: Arc<std::sync::Mutex<Option<SseCallback>>>,
    response_tx: mpsc::UnboundedSender<String>,
    response_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
    /// True while the GET stream is attached.
    sse_active: Arc<AtomicBool>,
    shutdown: CancellationToken,
    sse_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.config.endpoint.as_str())
            .field("sse_active", &self.sse_active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Construct a transport. No network I/O happens here.
    pub fn new(config: HttpTransportConfig) -> Self {
        let http_client = Arc::new(
            reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                // Default reqwest client construction cannot fail unless
                // TLS initialisation fails, which is fatal at startup.
                .expect("failed to build reqwest client"),
        );
        let sse_client = Arc::new(
            reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest SSE client"),
        );

        let (response_tx, response_rx) = mpsc::unbounded_channel();

        Self {
            http_client,
            sse_client,
            config,
            session_id: Arc::new(RwLock::new(None)),
            last_event_id: Arc::new(RwLock::new(None)),
            state: Arc::new(std::sync::Mutex::new(TransportState::Disconnected)),
            state_callback: Arc::new(std::sync::Mutex::new(None)),
            sse_callback: Arc::new(std::sync::Mutex::new(None)),
            response_tx,
            response_rx: Arc::new(tokio::sync::Mutex::new(response_rx)),
            sse_active: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            sse_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Register the callback fired once per state transition.
    pub fn on_state_change(&self, callback: impl Fn(TransportState) + Send + Sync + 'static) {
        let mut guard = self
            .state_callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(Arc::new(callback));
    }

    /// Register the callback invoked for every delivered SSE event.
    pub fn on_sse_event(&self, callback: impl Fn(SseEvent) + Send + Sync + 'static) {
        let mut guard = self
            .sse_callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Some(Arc::new(callback));
    }

    /// The active session ID, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    /// The ID of the last delivered SSE event, if any.
    pub async fn last_event_id(&self) -> Option<String> {
        self.last_event_id.read().await.clone()
    }

    /// Current state-machine position.
    pub fn state(&self) -> TransportState {
        *self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn set_state(&self, next: TransportState) {
        set_state_shared(&self.state, &self.state_callback, next);
    }

    /// Open the long-lived GET stream for server-initiated events.
    ///
    /// Issues `GET <endpoint>` with `Accept: text/event-stream` and
    /// `Cache-Control: no-cache`; requires a `200` with a
    /// `text/event-stream` content type. A background reader task parses
    /// events, updates the last event ID, and invokes the SSE callback in
    /// wire order. On EOF or I/O error the stream is marked disconnected
    /// and, when auto-reconnect is enabled, reconnected with backoff.
    ///
    /// At most one stream per transport instance.
    ///
    /// # Errors
    ///
    /// Returns [`McpgateError::Transport`] when the GET fails, the status
    /// is not `200`, or the content type is wrong; and
    /// [`McpgateError::Shutdown`] after [`close`](Transport::close).
    pub async fn open_sse_stream(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(McpgateError::Shutdown("transport closed".to_string()).into());
        }
        if self.sse_active.load(Ordering::SeqCst) {
            return Err(McpgateError::InvalidParams(
                "SSE stream already open for this transport".to_string(),
            )
            .into());
        }

        self.set_state(TransportState::Connecting);
        let shared = self.sse_shared();
        let response = match connect_sse(&shared).await {
            Ok(r) => r,
            Err(e) => {
                self.set_state(TransportState::Error);
                return Err(e);
            }
        };

        self.sse_active.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(sse_worker(shared, response));
        *self.sse_task.lock().await = Some(handle);
        Ok(())
    }

    /// Terminate the active session with a DELETE, then forget it.
    ///
    /// A no-op when no session is active.
    ///
    /// # Errors
    ///
    /// Returns [`McpgateError::Transport`] when the DELETE fails or the
    /// server answers with a non-success status.
    pub async fn terminate_session(&self) -> Result<()> {
        let Some(session) = self.session_id.read().await.clone() else {
            return Ok(());
        };

        let mut request = self
            .http_client
            .delete(self.config.endpoint.as_str())
            .header(HEADER_SESSION_ID, session.as_str());
        request = self.apply_common_headers(request);

        let response = request.send().await.map_err(|e| {
            McpgateError::Transport(format!("session DELETE failed: {e}"))
        })?;
        if !response.status().is_success() {
            return Err(McpgateError::Transport(format!(
                "session DELETE returned HTTP {}",
                response.status()
            ))
            .into());
        }

        *self.session_id.write().await = None;
        Ok(())
    }

    fn apply_common_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(key) = &self.config.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn sse_shared(&self) -> SseShared {
        SseShared {
            client: Arc::clone(&self.sse_client),
            endpoint: self.config.endpoint.clone(),
            api_key: self.config.api_key.clone(),
            headers: self.config.headers.clone(),
            session_id: Arc::clone(&self.session_id),
            last_event_id: Arc::clone(&self.last_event_id),
            response_tx: self.response_tx.clone(),
            sse_callback: Arc::clone(&self.sse_callback),
            state: Arc::clone(&self.state),
            state_callback: Arc::clone(&self.state_callback),
            sse_active: Arc::clone(&self.sse_active),
            shutdown: self.shutdown.clone(),
            auto_reconnect: self.config.sse_auto_reconnect,
            base_delay: self.config.sse_reconnect_base_delay,
            max_delay: self.config.sse_reconnect_max_delay,
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    /// Send one JSON-RPC message via HTTP POST.
    ///
    /// Headers on every POST: `Content-Type: application/json`,
    /// `Accept: application/json, text/event-stream`, the bearer token and
    /// custom headers from the config, and `Mcp-Session-Id` when a session
    /// is active. A response `Mcp-Session-Id` header replaces the stored
    /// session. Response bodies (JSON or SSE) are pushed to `receive()`;
    /// `202 Accepted` is a silent acknowledgement.
    async fn send(&self, message: String) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(McpgateError::Shutdown("transport closed".to_string()).into());
        }
        if self.state() == TransportState::Disconnected {
            self.set_state(TransportState::Connecting);
        }

        let mut request = self
            .http_client
            .post(self.config.endpoint.as_str())
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(message);
        request = self.apply_common_headers(request);

        {
            let session = self.session_id.read().await;
            if let Some(id) = session.as_deref() {
                request = request.header(HEADER_SESSION_ID, id);
            }
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                self.set_state(TransportState::Error);
                return Err(McpgateError::Transport(format!("HTTP POST failed: {e}")).into());
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            // An active session that 404s has expired server-side.
            let mut session = self.session_id.write().await;
            if session.is_some() {
                *session = None;
                self.set_state(TransportState::Error);
                return Err(
                    McpgateError::Transport("MCP session expired (HTTP 404)".to_string()).into(),
                );
            }
        }
        if !status.is_success() {
            self.set_state(TransportState::Error);
            return Err(
                McpgateError::Transport(format!("HTTP POST returned status {status}")).into(),
            );
        }

        // Set or rotate the session from the response header.
        if let Some(new_session) = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            *self.session_id.write().await = Some(new_session);
        }

        let connected_state = if self.sse_active.load(Ordering::SeqCst) {
            TransportState::SseConnected
        } else {
            TransportState::Connected
        };
        self.set_state(connected_state);

        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("text/event-stream") {
            // Response stream for this POST: events feed receive() but do
            // not count as the transport's single GET stream.
            let byte_stream = response.bytes_stream();
            let response_tx = self.response_tx.clone();
            let last_event_id = Arc::clone(&self.last_event_id);
            let sse_callback = Arc::clone(&self.sse_callback);
            tokio::spawn(async move {
                read_sse_bytes(byte_stream, &response_tx, &last_event_id, &sse_callback).await;
            });
        } else {
            let body = response.text().await.map_err(|e| {
                McpgateError::Transport(format!("failed to read response body: {e}"))
            })?;
            if !body.is_empty() {
                let _ = self.response_tx.send(body);
            }
        }

        Ok(())
    }

    /// Stream of inbound messages, in the order they were received.
    fn receive(&self) -> Pin<Box<dyn Stream<Item = String> + Send + '_>> {
        let rx = Arc::clone(&self.response_rx);
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            let mut guard = rx.lock().await;
            let item = guard.recv().await?;
            drop(guard);
            Some((item, rx))
        }))
    }

    /// Stop the reader task and refuse further sends. Idempotent.
    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(handle) = self.sse_task.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
        self.sse_active.store(false, Ordering::SeqCst);
        self.set_state(TransportState::Disconnected);
        Ok(())
    }
}

fn set_state_shared(
    state: &std::sync::Mutex<TransportState>,
    callback: &std::sync::Mutex<Option<StateCallback>>,
    next: TransportState,
) {
    let changed = {
        let mut current = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    };
    if changed {
        let cb = callback
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(cb) = cb {
            cb(next);
        }
    }
}

// ---------------------------------------------------------------------------
// GET stream worker
// ---------------------------------------------------------------------------

/// Everything the detached SSE worker needs, cloned out of the transport.
struct SseShared {
    client: Arc<reqwest::Client>,
    endpoint: url::Url,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    session_id: Arc<RwLock<Option<String>>>,
    last_event_id: Arc<RwLock<Option<String>>>,
    response_tx: mpsc::UnboundedSender<String>,
    sse_callback: Arc<std::sync::Mutex<Option<SseCallback>>>,
    state: Arc<std::sync::Mutex<TransportState>>,
    state_callback: Arc<std::sync::Mutex<Option<StateCallback>>>,
    sse_active: Arc<AtomicBool>,
    shutdown: CancellationToken,
    auto_reconnect: bool,
    base_delay: Duration,
    max_delay: Duration,
}

impl SseShared {
    fn set_state(&self, next: TransportState) {
        set_state_shared(&self.state, &self.state_callback, next);
    }
}

/// Issue the SSE GET and validate status + content type.
async fn connect_sse(shared: &SseShared) -> Result<reqwest::Response> {
    let mut request = shared
        .client
        .get(shared.endpoint.as_str())
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache");

    if let Some(key) = &shared.api_key {
        request = request.header("Authorization", format!("Bearer {key}"));
    }
    for (name, value) in &shared.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    {
        let session = shared.session_id.read().await;
        if let Some(id) = session.as_deref() {
            request = request.header(HEADER_SESSION_ID, id);
        }
    }
    {
        let last = shared.last_event_id.read().await;
        if let Some(id) = last.as_deref() {
            request = request.header("Last-Event-ID", id);
        }
    }

    let response = request
        .send()
        .await
        .map_err(|e| McpgateError::Transport(format!("SSE GET failed: {e}")))?;

    if response.status() != reqwest::StatusCode::OK {
        return Err(McpgateError::Transport(format!(
            "SSE GET returned HTTP {}",
            response.status()
        ))
        .into());
    }
    let content_type = response
        .headers()
        .get("Content-Type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type
        .to_ascii_lowercase()
        .starts_with("text/event-stream")
    {
        return Err(McpgateError::Transport(format!(
            "SSE GET returned unexpected content type '{content_type}'"
        ))
        .into());
    }
    Ok(response)
}

/// Drive the GET stream: read events until it drops, then reconnect with
/// jittered exponential backoff while enabled.
async fn sse_worker(shared: SseShared, first_response: reqwest::Response) {
    let mut response = Some(first_response);
    let mut failures: u32 = 0;

    loop {
        if let Some(resp) = response.take() {
            shared.sse_active.store(true, Ordering::SeqCst);
            shared.set_state(TransportState::SseConnected);
            failures = 0;

            let byte_stream = resp.bytes_stream();
            tokio::select! {
                _ = shared.shutdown.cancelled() => {
                    shared.sse_active.store(false, Ordering::SeqCst);
                    shared.set_state(TransportState::Disconnected);
                    return;
                }
                _ = read_sse_bytes(
                    byte_stream,
                    &shared.response_tx,
                    &shared.last_event_id,
                    &shared.sse_callback,
                ) => {}
            }

            shared.sse_active.store(false, Ordering::SeqCst);
            if shared.shutdown.is_cancelled() {
                shared.set_state(TransportState::Disconnected);
                return;
            }
            shared.set_state(TransportState::Error);
            if !shared.auto_reconnect {
                return;
            }
            tracing::debug!("SSE stream dropped; scheduling reconnect");
        }

        let delay = backoff_delay(shared.base_delay, failures, shared.max_delay);
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.set_state(TransportState::Disconnected);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        shared.set_state(TransportState::Connecting);
        match connect_sse(&shared).await {
            Ok(resp) => response = Some(resp),
            Err(e) => {
                failures = failures.saturating_add(1);
                tracing::warn!(error = %e, failures, "SSE reconnect attempt failed");
                shared.set_state(TransportState::Error);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SSE parser
// ---------------------------------------------------------------------------

/// Consume an SSE byte stream, delivering each complete event to the
/// callback and its data payload to `response_tx`.
///
/// Events are framed by a blank line (`\n\n` or `\r\n\r\n`); a trailing
/// partial event is never delivered. Field values keep everything after
/// the colon minus one optional leading space; multiple `data:` lines are
/// joined with `\n`. Each delivered event with an `id:` updates
/// `last_event_id`.
async fn read_sse_bytes(
    byte_stream: impl Stream<Item = reqwest::Result<Bytes>>,
    response_tx: &mpsc::UnboundedSender<String>,
    last_event_id: &Arc<RwLock<Option<String>>>,
    sse_callback: &Arc<std::sync::Mutex<Option<SseCallback>>>,
) {
    use futures::StreamExt;

    let mut buffer = String::new();
    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(c) => c,
            Err(_) => break,
        };
        let Ok(text) = std::str::from_utf8(&chunk) else {
            continue;
        };
        buffer.push_str(text);

        while let Some(block) = take_event_block(&mut buffer) {
            let Some(event) = parse_event_block(&block) else {
                continue;
            };
            if let Some(id) = &event.id {
                *last_event_id.write().await = Some(id.clone());
            }
            let callback = sse_callback
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            if let Some(callback) = callback {
                callback(event.clone());
            }
            let _ = response_tx.send(event.data);
        }
    }
}

/// Split one complete event block off the front of `buffer`, if a blank
/// line terminator has arrived.
fn take_event_block(buffer: &mut String) -> Option<String> {
    let lf = buffer.find("\n\n");
    let crlf = buffer.find("\r\n\r\n");

    let (end, sep_len) = match (lf, crlf) {
        (None, None) => return None,
        (Some(l), None) => (l, 2),
        (None, Some(c)) => (c, 4),
        (Some(l), Some(c)) => {
            if c < l {
                (c, 4)
            } else {
                (l, 2)
            }
        }
    };

    let block = buffer[..end].to_string();
    buffer.drain(..end + sep_len);
    Some(block)
}

/// Parse one event block. Returns `None` for blocks with no `data:` lines
/// (comments, bare `id:`/`event:` fields).
fn parse_event_block(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut id: Option<&str> = None;
    let mut event: Option<&str> = None;

    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(strip_one_space(value));
        } else if let Some(value) = line.strip_prefix("id:") {
            id = Some(strip_one_space(value));
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(strip_one_space(value));
        }
        // retry: is ignored; reconnect timing comes from configuration.
    }

    if data_lines.is_empty() {
        return None;
    }
    Some(SseEvent {
        id: id.map(str::to_string),
        event: event.map(str::to_string),
        data: data_lines.join("\n"),
    })
}

/// Field values keep everything after the colon minus one optional space.
fn strip_one_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}
