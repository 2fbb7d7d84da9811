//! Transport-agnostic MCP client
//!
//! [`McpClient`] pairs any [`Transport`] with the pending-request
//! registry: `request()` assigns the next monotonic ID, registers a
//! waiter *before* the bytes leave the process (so a fast response can
//! never be lost), sends through the transport, and awaits the waiter
//! with a deadline. A background dispatcher task consumes the transport's
//! inbound stream, matches responses to waiters strictly by ID, and hands
//! notifications to per-method callbacks. Out-of-order responses are
//! normal and supported.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::codec::{Codec, JsonRpcError, JsonRpcRequest};
use crate::error::{McpgateError, Result};
use crate::pending::PendingRegistry;
use crate::transport::Transport;

/// Default timeout applied when the caller does not specify one.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A notification handler: called with the raw `params` value when a
/// matching server notification arrives.
type NotificationHandler = Box<dyn Fn(serde_json::Value) + Send + Sync + 'static>;

/// Transport-agnostic MCP client.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use mcpgate::client::McpClient;
/// use mcpgate::codec::JsonCodec;
/// use mcpgate::transport::http::{HttpTransport, HttpTransportConfig};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = Arc::new(HttpTransport::new(HttpTransportConfig::new(
///     url::Url::parse("http://localhost:3000/mcp")?,
/// )));
/// let client = McpClient::new(transport, Arc::new(JsonCodec));
/// client.start();
/// let pong: serde_json::Value = client
///     .request("ping", serde_json::json!({}), None)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct McpClient {
    transport: Arc<dyn Transport>,
    registry: Arc<PendingRegistry>,
    codec: Arc<dyn Codec>,
    default_timeout: Duration,
    notification_handlers: Arc<Mutex<HashMap<String, NotificationHandler>>>,
    cancellation: CancellationToken,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("pending", &self.registry.count())
            .finish_non_exhaustive()
    }
}

impl McpClient {
    /// Create a client over `transport`. Call [`start`](Self::start) to
    /// spawn the inbound dispatcher before issuing requests.
    pub fn new(transport: Arc<dyn Transport>, codec: Arc<dyn Codec>) -> Self {
        Self {
            transport,
            registry: Arc::new(PendingRegistry::new()),
            codec,
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            notification_handlers: Arc::new(Mutex::new(HashMap::new())),
            cancellation: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Override the default per-request timeout.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// The registry backing this client. Exposed for observability.
    pub fn registry(&self) -> &Arc<PendingRegistry> {
        &self.registry
    }

    /// Spawn the dispatcher task that resolves responses and routes
    /// notifications. Calling it twice replaces nothing: the second call
    /// is a no-op.
    pub fn start(&self) {
        let mut guard = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return;
        }

        let transport = Arc::clone(&self.transport);
        let registry = Arc::clone(&self.registry);
        let handlers = Arc::clone(&self.notification_handlers);
        let cancellation = self.cancellation.clone();

        *guard = Some(tokio::spawn(async move {
            use futures::StreamExt;
            let stream = transport.receive();
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        registry.drain();
                        break;
                    }
                    message = stream.next() => {
                        let Some(raw) = message else {
                            // Transport stream ended; release all waiters.
                            registry.drain();
                            break;
                        };
                        dispatch_message(&raw, &registry, &handlers);
                    }
                }
            }
        }));
    }

    /// Send a request and await the typed response.
    ///
    /// # Errors
    ///
    /// Transport failures propagate as [`McpgateError::Transport`]; a
    /// missed deadline is [`McpgateError::Timeout`] (the pending entry is
    /// removed either way); a peer error response is
    /// [`McpgateError::Rpc`].
    pub async fn request<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        P: serde::Serialize + Send,
        R: serde::de::DeserializeOwned,
    {
        let id = self.registry.next_id();
        // Register before sending so the response can never arrive ahead
        // of its waiter.
        let waiter = self.registry.add(id)?;

        let request = JsonRpcRequest::new(id, method, serde_json::to_value(params)?);
        let message = match encode_as_string(self.codec.as_ref(), &request) {
            Ok(m) => m,
            Err(e) => {
                self.registry.remove(id);
                return Err(e);
            }
        };

        // One deadline covers the whole call: the send (which on the HTTP
        // transport blocks until the server answers the POST) and the wait
        // on the registry notifier.
        let deadline = timeout.unwrap_or(self.default_timeout);
        let started = std::time::Instant::now();
        match tokio::time::timeout(deadline, self.transport.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.registry.remove(id);
                return Err(e);
            }
            Err(_elapsed) => {
                self.registry.remove(id);
                return Err(McpgateError::Timeout(format!(
                    "request {id} timed out after {}ms",
                    deadline.as_millis()
                ))
                .into());
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let value = self.registry.wait(waiter, remaining).await?;
        serde_json::from_value(value).map_err(|e| McpgateError::Serialization(e).into())
    }

    /// Send a notification (no ID, no response expected).
    pub async fn notify<P: serde::Serialize + Send>(&self, method: &str, params: P) -> Result<()> {
        let request = JsonRpcRequest::notification(method, serde_json::to_value(params)?);
        let message = encode_as_string(self.codec.as_ref(), &request)?;
        self.transport.send(message).await
    }

    /// Register a handler for a server-sent notification. Registering a
    /// second handler for the same method replaces the first.
    pub fn on_notification(
        &self,
        method: impl Into<String>,
        handler: impl Fn(serde_json::Value) + Send + Sync + 'static,
    ) {
        self.notification_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(method.into(), Box::new(handler));
    }

    /// Stop the dispatcher, drain every pending waiter, and close the
    /// transport.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancellation.cancel();
        self.registry.drain();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.transport.close().await
    }
}

fn encode_as_string(codec: &dyn Codec, request: &JsonRpcRequest) -> Result<String> {
    let bytes = codec.encode_request(request)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| McpgateError::Internal("codec produced non-UTF-8 message".to_string()).into())
}

/// Classify one inbound message and dispatch it: responses resolve the
/// registry by ID, notifications go to their handler, anything else is
/// logged and dropped.
fn dispatch_message(
    raw: &str,
    registry: &Arc<PendingRegistry>,
    handlers: &Arc<Mutex<HashMap<String, NotificationHandler>>>,
) {
    let value: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "dispatcher: unparseable inbound message");
            return;
        }
    };

    let has_id = value.get("id").is_some_and(|id| !id.is_null());
    let has_method = value.get("method").is_some();
    let has_outcome = value.get("result").is_some() || value.get("error").is_some();

    if has_id && has_outcome && !has_method {
        resolve_response(&value, registry);
    } else if has_method && !has_id {
        let method = value["method"].as_str().unwrap_or_default().to_string();
        let params = value
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let guard = handlers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handler) = guard.get(&method) {
            handler(params);
        } else {
            tracing::debug!(method, "dispatcher: no handler for notification");
        }
    } else {
        tracing::debug!("dispatcher: unclassifiable message ignored");
    }
}

fn resolve_response(value: &serde_json::Value, registry: &Arc<PendingRegistry>) {
    let id_value = &value["id"];
    let id = if let Some(n) = id_value.as_u64() {
        n
    } else if let Some(n) = id_value.as_str().and_then(|s| s.parse::<u64>().ok()) {
        n
    } else {
        tracing::warn!(id = %id_value, "dispatcher: response with non-integer id");
        return;
    };

    let outcome = if let Some(error_value) = value.get("error") {
        let error: JsonRpcError =
            serde_json::from_value(error_value.clone()).unwrap_or(JsonRpcError {
                code: crate::codec::CODE_INTERNAL_ERROR,
                message: format!("malformed error object: {error_value}"),
                data: None,
            });
        Err(error)
    } else {
        Ok(value
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    };

    if !registry.complete(id, outcome) {
        tracing::debug!(id, "dispatcher: response for unknown id ignored");
    }
}
