//! JSON-RPC 2.0 wire types and the pluggable codec seam
//!
//! The correlation, pooling, and gateway layers never parse bytes
//! themselves: all encoding and decoding goes through the [`Codec`] trait.
//! [`JsonCodec`] is the default implementation, built on `serde_json`.
//! Alternative wire formats can be slotted in by implementing [`Codec`]
//! and handing the implementation to the client or gateway.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{McpgateError, Result};

// ---------------------------------------------------------------------------
// Method constants
// ---------------------------------------------------------------------------

/// Read the contents of a resource by URI; routed by the gateway.
pub const METHOD_READ_RESOURCE: &str = "read_resource";
/// Invoke a named tool; routed by the gateway.
pub const METHOD_CALL_TOOL: &str = "call_tool";
/// Keepalive ping.
pub const METHOD_PING: &str = "ping";

// ---------------------------------------------------------------------------
// JSON-RPC error codes
// ---------------------------------------------------------------------------

/// Invalid JSON was received.
pub const CODE_PARSE_ERROR: i64 = -32700;
/// The method does not exist or is not routable.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const CODE_INVALID_PARAMS: i64 = -32602;
/// Internal JSON-RPC error.
pub const CODE_INTERNAL_ERROR: i64 = -32603;
/// Transport-level failure while forwarding (server-defined range).
pub const CODE_TRANSPORT_ERROR: i64 = -32000;
/// The request timed out before a response arrived.
pub const CODE_TIMEOUT: i64 = -32001;
/// No backend serves the requested resource URI.
pub const CODE_RESOURCE_NOT_FOUND: i64 = -32002;
/// No backend exposes the requested tool.
pub const CODE_TOOL_UNAVAILABLE: i64 = -32003;

// ---------------------------------------------------------------------------
// JSON-RPC 2.0 wire types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request object.
///
/// `jsonrpc` MUST always be `"2.0"`. `id` is `None` for notifications.
///
/// # Examples
///
/// ```
/// use mcpgate::codec::JsonRpcRequest;
///
/// let req = JsonRpcRequest::new(1, "ping", serde_json::json!({}));
/// assert_eq!(req.jsonrpc, "2.0");
/// assert_eq!(req.method, "ping");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// Request ID; absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Build a request with a numeric ID.
    pub fn new(id: u64, method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::json!(id)),
            method: method.into(),
            params: Some(params),
        }
    }

    /// Build a notification (no ID, no response expected).
    pub fn notification(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }

    /// The numeric request ID, when present and integral.
    pub fn numeric_id(&self) -> Option<u64> {
        numeric_id(self.id.as_ref())
    }

    /// Fetch a string field out of `params` (e.g. `uri` or `name`).
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

/// A JSON-RPC 2.0 response object. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version identifier; always `"2.0"`.
    pub jsonrpc: String,
    /// ID of the request being answered; mirrors the request's `id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    /// Successful result payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a successful response echoing `id`.
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing `id`.
    pub fn error(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// The numeric response ID, when present and integral.
    pub fn numeric_id(&self) -> Option<u64> {
        numeric_id(self.id.as_ref())
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured error payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Extract a numeric ID from a JSON-RPC `id` value. String-typed integral
/// IDs are accepted for interoperability with servers that echo IDs as
/// strings.
fn numeric_id(id: Option<&serde_json::Value>) -> Option<u64> {
    let id = id?;
    if let Some(n) = id.as_u64() {
        return Some(n);
    }
    id.as_str()?.parse::<u64>().ok()
}

// ---------------------------------------------------------------------------
// Codec trait
// ---------------------------------------------------------------------------

/// Pluggable message codec consumed by the correlation and gateway layers.
///
/// Implementations must be cheap to call concurrently; the runtime shares a
/// single codec instance across all connections of a client or gateway.
pub trait Codec: Send + Sync + std::fmt::Debug {
    /// Serialize a request into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns [`McpgateError::Serialization`] when the request cannot be
    /// encoded.
    fn encode_request(&self, request: &JsonRpcRequest) -> Result<Bytes>;

    /// Parse wire bytes into a response.
    ///
    /// # Errors
    ///
    /// Returns [`McpgateError::Parse`] when the bytes are not a valid
    /// response.
    fn decode_response(&self, bytes: &[u8]) -> Result<JsonRpcResponse>;

    /// Parse wire bytes into a request (gateway inbound path).
    ///
    /// # Errors
    ///
    /// Returns [`McpgateError::Parse`] when the bytes are not a valid
    /// request.
    fn decode_request(&self, bytes: &[u8]) -> Result<JsonRpcRequest>;

    /// Encode an error response that preserves the inbound request ID, so
    /// callers always see a single well-formed reply.
    fn encode_error_response(
        &self,
        id: serde_json::Value,
        code: i64,
        message: &str,
    ) -> Bytes;
}

/// The default JSON codec.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_request(&self, request: &JsonRpcRequest) -> Result<Bytes> {
        let bytes = serde_json::to_vec(request)?;
        Ok(Bytes::from(bytes))
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<JsonRpcResponse> {
        serde_json::from_slice::<JsonRpcResponse>(bytes)
            .map_err(|e| McpgateError::Parse(format!("invalid response: {e}")).into())
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<JsonRpcRequest> {
        serde_json::from_slice::<JsonRpcRequest>(bytes)
            .map_err(|e| McpgateError::Parse(format!("invalid request: {e}")).into())
    }

    fn encode_error_response(
        &self,
        id: serde_json::Value,
        code: i64,
        message: &str,
    ) -> Bytes {
        let response = JsonRpcResponse::error(id, code, message);
        // Serializing a response built from owned fields cannot fail.
        match serde_json::to_vec(&response) {
            Ok(v) => Bytes::from(v),
            Err(_) => Bytes::from_static(
                br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"encode failure"}}"#,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let codec = JsonCodec;
        let req = JsonRpcRequest::new(7, METHOD_PING, serde_json::json!({"k": "v"}));
        let bytes = codec.encode_request(&req).unwrap();
        let back = codec.decode_request(&bytes).unwrap();
        assert_eq!(back.method, METHOD_PING);
        assert_eq!(back.numeric_id(), Some(7));
        assert_eq!(back.param_str("k"), Some("v"));
    }

    #[test]
    fn test_notification_has_no_id() {
        let codec = JsonCodec;
        let req = JsonRpcRequest::notification("notifications/progress", serde_json::json!({}));
        let bytes = codec.encode_request(&req).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("id").is_none(), "notifications must not carry an id");
    }

    #[test]
    fn test_decode_response_success() {
        let codec = JsonCodec;
        let raw = br#"{"jsonrpc":"2.0","id":3,"result":{"pong":true}}"#;
        let resp = codec.decode_response(raw).unwrap();
        assert_eq!(resp.numeric_id(), Some(3));
        assert_eq!(resp.result.unwrap()["pong"], true);
        assert!(resp.error.is_none());
    }

    #[test]
    fn test_decode_response_error_object() {
        let codec = JsonCodec;
        let raw = br#"{"jsonrpc":"2.0","id":3,"error":{"code":-32601,"message":"nope"}}"#;
        let resp = codec.decode_response(raw).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, CODE_METHOD_NOT_FOUND);
        assert_eq!(err.message, "nope");
    }

    #[test]
    fn test_decode_garbage_is_parse_error() {
        let codec = JsonCodec;
        let err = codec.decode_response(b"not json").unwrap_err();
        let typed = crate::error::as_mcpgate_error(&err).unwrap();
        assert!(matches!(typed, McpgateError::Parse(_)));
    }

    #[test]
    fn test_string_id_accepted() {
        let codec = JsonCodec;
        let raw = br#"{"jsonrpc":"2.0","id":"42","result":{}}"#;
        let resp = codec.decode_response(raw).unwrap();
        assert_eq!(resp.numeric_id(), Some(42));
    }

    #[test]
    fn test_error_response_preserves_id() {
        let codec = JsonCodec;
        let bytes =
            codec.encode_error_response(serde_json::json!(99), CODE_TRANSPORT_ERROR, "broken");
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["id"], 99);
        assert_eq!(value["error"]["code"], CODE_TRANSPORT_ERROR);
        assert_eq!(value["error"]["message"], "broken");
        assert!(value.get("result").is_none());
    }
}
