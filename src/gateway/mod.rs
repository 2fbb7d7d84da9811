//! Gateway router and forwarder
//!
//! The gateway fronts a fleet of MCP backends. Each inbound request is
//! matched against declarative per-backend routing rules
//! ([`router::route`]), forwarded over a pooled length-prefixed TCP
//! connection ([`forward::forward`]), and answered with either the
//! backend's bytes or a JSON-RPC error response that preserves the
//! inbound request ID, so callers always see exactly one well-formed reply.

pub mod forward;
pub mod router;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use regex::Regex;

use crate::codec::{
    Codec, JsonRpcRequest, CODE_INTERNAL_ERROR, CODE_METHOD_NOT_FOUND, CODE_PARSE_ERROR,
    CODE_RESOURCE_NOT_FOUND, CODE_TIMEOUT, CODE_TOOL_UNAVAILABLE, CODE_TRANSPORT_ERROR,
    METHOD_CALL_TOOL, METHOD_READ_RESOURCE,
};
use crate::config::BackendConfig;
use crate::error::{as_mcpgate_error, McpgateError, Result};
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};

/// Declarative routing rules for one backend.
#[derive(Debug, Default)]
pub struct RoutingRules {
    /// Resource URI prefixes; first match wins, checked before regexes.
    pub uri_prefixes: Vec<String>,
    /// Compiled resource URI patterns.
    pub uri_regexes: Vec<Regex>,
    /// Exact tool names served by this backend.
    pub tool_names: Vec<String>,
}

/// One downstream MCP server the gateway forwards to.
#[derive(Debug)]
pub struct Backend {
    /// Configured backend name, for logs and stats.
    pub name: String,
    /// Per-request timeout budget (borrow + I/O).
    pub timeout: Duration,
    /// Routing rules matched by [`router::route`].
    pub rules: RoutingRules,
    /// Pooled connections to this backend.
    pub pool: ConnectionPool,
}

impl Backend {
    /// Build a backend from its config entry, compiling regexes and
    /// creating the connection pool.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Config`] for a malformed address or regex.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let (host, port) = parse_address(&config.address)?;

        let mut uri_regexes = Vec::with_capacity(config.resource_regexes.len());
        for pattern in &config.resource_regexes {
            let regex = Regex::new(pattern).map_err(|e| {
                McpgateError::Config(format!(
                    "backend '{}': invalid resource regex '{pattern}': {e}",
                    config.name
                ))
            })?;
            uri_regexes.push(regex);
        }

        let mut pool_config = PoolConfig::new(host, port);
        if let Some(max) = config.pool_max_connections {
            pool_config.max_connections = max;
        }
        if let Some(min) = config.pool_min_connections {
            pool_config.min_connections = min;
        }

        Ok(Self {
            name: config.name.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            rules: RoutingRules {
                uri_prefixes: config.resource_prefixes.clone(),
                uri_regexes,
                tool_names: config.tool_names.clone(),
            },
            pool: ConnectionPool::new(pool_config),
        })
    }
}

/// Split `"host:port"`, accepting bracketed IPv6 hosts.
fn parse_address(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| McpgateError::Config(format!("address '{address}' is missing a port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| McpgateError::Config(format!("address '{address}' has an invalid port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(McpgateError::Config(format!("address '{address}' has an empty host")).into());
    }
    Ok((host.to_string(), port))
}

/// Stateless request dispatcher over the configured backend fleet.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use mcpgate::codec::JsonCodec;
/// use mcpgate::config::BackendConfig;
/// use mcpgate::gateway::{Backend, GatewayRouter};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let backend = Backend::from_config(&BackendConfig {
///     name: "users".to_string(),
///     address: "127.0.0.1:9100".to_string(),
///     timeout_ms: 5000,
///     resource_prefixes: vec!["example://users/".to_string()],
///     resource_regexes: vec![],
///     tool_names: vec![],
///     pool_min_connections: None,
///     pool_max_connections: None,
/// })?;
/// let gateway = GatewayRouter::new(vec![backend], Arc::new(JsonCodec));
/// let reply = gateway
///     .handle(br#"{"jsonrpc":"2.0","id":1,"method":"read_resource","params":{"uri":"example://users/42"}}"#)
///     .await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct GatewayRouter {
    backends: Vec<Backend>,
    codec: Arc<dyn Codec>,
}

impl GatewayRouter {
    /// Router over `backends`, encoding replies with `codec`.
    pub fn new(backends: Vec<Backend>, codec: Arc<dyn Codec>) -> Self {
        Self { backends, codec }
    }

    /// The configured backends, in routing order.
    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Dispatch one raw request and produce exactly one raw reply.
    ///
    /// Undecodable bytes yield a parse-error response with a null ID;
    /// routing misses yield resource/tool/method errors; forwarding
    /// failures are mapped onto the JSON-RPC error space with the inbound
    /// ID preserved.
    pub async fn handle(&self, request_bytes: &[u8]) -> Bytes {
        let request = match self.codec.decode_request(request_bytes) {
            Ok(request) => request,
            Err(e) => {
                return self.codec.encode_error_response(
                    serde_json::Value::Null,
                    CODE_PARSE_ERROR,
                    &format!("unparseable request: {e}"),
                );
            }
        };
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);

        let Some(backend) = router::route(&request, &self.backends) else {
            let (code, message) = routing_miss(&request);
            tracing::debug!(method = %request.method, code, "no backend matched request");
            return self.codec.encode_error_response(id, code, &message);
        };

        tracing::debug!(backend = %backend.name, method = %request.method, "forwarding request");
        match forward::forward(backend, self.codec.as_ref(), &request).await {
            Ok(response) => response,
            Err(e) => {
                let (code, message) = forward_failure(&backend.name, &e);
                tracing::warn!(backend = %backend.name, code, error = %e, "forwarding failed");
                self.codec.encode_error_response(id, code, &message)
            }
        }
    }

    /// Per-backend pool statistics.
    pub fn stats(&self) -> Vec<(String, PoolStats)> {
        self.backends
            .iter()
            .map(|b| (b.name.clone(), b.pool.stats()))
            .collect()
    }

    /// Destroy every backend pool.
    pub async fn shutdown(&self) {
        for backend in &self.backends {
            backend.pool.destroy().await;
        }
    }
}

/// Error code and message for a request no backend matched.
fn routing_miss(request: &JsonRpcRequest) -> (i64, String) {
    match request.method.as_str() {
        METHOD_READ_RESOURCE => (
            CODE_RESOURCE_NOT_FOUND,
            format!(
                "no backend serves resource '{}'",
                request.param_str("uri").unwrap_or("")
            ),
        ),
        METHOD_CALL_TOOL => (
            CODE_TOOL_UNAVAILABLE,
            format!(
                "no backend exposes tool '{}'",
                request.param_str("name").unwrap_or("")
            ),
        ),
        other => (
            CODE_METHOD_NOT_FOUND,
            format!("method '{other}' is not routable"),
        ),
    }
}

/// Map a forwarding failure onto the JSON-RPC error space.
fn forward_failure(backend: &str, error: &anyhow::Error) -> (i64, String) {
    let code = match as_mcpgate_error(error) {
        Some(McpgateError::Timeout(_)) => CODE_TIMEOUT,
        Some(McpgateError::Parse(_)) => CODE_PARSE_ERROR,
        Some(McpgateError::Transport(_) | McpgateError::Shutdown(_)) => CODE_TRANSPORT_ERROR,
        _ => CODE_INTERNAL_ERROR,
    };
    (code, format!("backend '{backend}': {error}"))
}
