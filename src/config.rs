//! Configuration management for mcpgate
//!
//! This module handles loading, parsing, and validating the YAML
//! configuration consumed by the gateway host binary. Transport configs
//! ([`crate::transport::http::HttpTransportConfig`],
//! [`crate::transport::mqtt::MqttTransportConfig`]) are plain structs
//! built by embedding applications; only the gateway surface is
//! file-driven.

use crate::error::{McpgateError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure for the mcpgate binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway listener and backend fleet.
    #[serde(default)]
    pub gateway: GatewayConfig,
}

/// Gateway frontend and routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Address the framed TCP frontend binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Downstream backends, in routing precedence order.
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            backends: Vec::new(),
        }
    }
}

/// One downstream backend entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique backend name, used in logs and stats.
    pub name: String,
    /// `host:port` of the backend's framed TCP listener.
    pub address: String,
    /// Per-request timeout budget in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Resource URI prefixes routed to this backend.
    #[serde(default)]
    pub resource_prefixes: Vec<String>,
    /// Resource URI regexes routed to this backend.
    #[serde(default)]
    pub resource_regexes: Vec<String>,
    /// Exact tool names served by this backend.
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// Override for the pool's minimum connection count.
    #[serde(default)]
    pub pool_min_connections: Option<usize>,
    /// Override for the pool's maximum connection count.
    #[serde(default)]
    pub pool_max_connections: Option<usize>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:9900".to_string()
}

fn default_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load and parse the YAML file at `path`.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Config`] when the file cannot be read, and
    /// [`McpgateError::Yaml`] when it does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            McpgateError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Check invariants a running gateway depends on: unique backend
    /// names, well-formed addresses, and nonzero timeouts.
    ///
    /// # Errors
    ///
    /// [`McpgateError::Config`] describing the first violation found.
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        for backend in &self.gateway.backends {
            if backend.name.is_empty() {
                return Err(McpgateError::Config("backend with empty name".to_string()).into());
            }
            if !names.insert(backend.name.as_str()) {
                return Err(McpgateError::Config(format!(
                    "duplicate backend name '{}'",
                    backend.name
                ))
                .into());
            }
            if !backend.address.contains(':') {
                return Err(McpgateError::Config(format!(
                    "backend '{}' address '{}' is missing a port",
                    backend.name, backend.address
                ))
                .into());
            }
            if backend.timeout_ms == 0 {
                return Err(McpgateError::Config(format!(
                    "backend '{}' has a zero timeout",
                    backend.name
                ))
                .into());
            }
            let has_rule = !backend.resource_prefixes.is_empty()
                || !backend.resource_regexes.is_empty()
                || !backend.tool_names.is_empty();
            if !has_rule {
                tracing::warn!(
                    backend = %backend.name,
                    "backend has no routing rules and will never be selected"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
gateway:
  listen_addr: "127.0.0.1:9900"
  backends:
    - name: users
      address: "127.0.0.1:9100"
      timeout_ms: 2500
      resource_prefixes: ["example://users/"]
    - name: tools
      address: "127.0.0.1:9101"
      tool_names: ["echo"]
      pool_max_connections: 4
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: Config = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(config.gateway.listen_addr, "127.0.0.1:9900");
        assert_eq!(config.gateway.backends.len(), 2);
        assert_eq!(config.gateway.backends[0].timeout_ms, 2500);
        assert_eq!(config.gateway.backends[1].timeout_ms, 5000, "default applies");
        assert_eq!(config.gateway.backends[1].pool_max_connections, Some(4));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_gets_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.gateway.listen_addr, "127.0.0.1:9900");
        assert!(config.gateway.backends.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_backend_names_rejected() {
        let yaml = r#"
gateway:
  backends:
    - { name: a, address: "h:1", tool_names: [t] }
    - { name: a, address: "h:2", tool_names: [u] }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_without_port_rejected() {
        let yaml = r#"
gateway:
  backends:
    - { name: a, address: "hostonly", tool_names: [t] }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = r#"
gateway:
  backends:
    - { name: a, address: "h:1", timeout_ms: 0, tool_names: [t] }
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load("/nonexistent/mcpgate.yaml").unwrap_err();
        assert!(matches!(
            crate::error::as_mcpgate_error(&err),
            Some(McpgateError::Config(_))
        ));
    }
}
