//! mcpgate - transport-pluggable MCP runtime library
//!
//! This library provides the transport-independent request/response
//! correlation, streaming, and connection-lifecycle layer of an MCP
//! (Model Context Protocol) runtime, plus a gateway that routes requests
//! across a fleet of backend servers.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `pending`: pending-request registry pairing request IDs with waiters
//! - `pool`: per-backend TCP connection pool with health scoring
//! - `dns`: process-wide DNS cache shared by all pools
//! - `framing`: length-prefixed message framing over byte streams
//! - `transport`: Streamable HTTP and MQTT client transports
//! - `client`: transport-agnostic MCP client facade
//! - `gateway`: request router and forwarder over the backend fleet
//! - `codec`: JSON-RPC wire types and the pluggable codec seam
//! - `config`: configuration management and validation
//! - `error`: error types and result aliases
//! - `cli`: command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mcpgate::client::McpClient;
//! use mcpgate::codec::JsonCodec;
//! use mcpgate::transport::http::{HttpTransport, HttpTransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let transport = Arc::new(HttpTransport::new(HttpTransportConfig::new(
//!         url::Url::parse("http://localhost:3000/mcp")?,
//!     )));
//!     let client = McpClient::new(transport, Arc::new(JsonCodec));
//!     client.start();
//!     let pong: serde_json::Value = client
//!         .request("ping", serde_json::json!({}), None)
//!         .await?;
//!     println!("{pong}");
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod dns;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod pending;
pub mod pool;
pub mod transport;

// Re-export commonly used types
pub use client::McpClient;
pub use codec::{Codec, JsonCodec, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use config::Config;
pub use error::{McpgateError, Result};
pub use gateway::GatewayRouter;
pub use pending::PendingRegistry;
pub use pool::{ConnectionPool, PoolConfig};
