//! Command-line interface definition for mcpgate
//!
//! This module defines the CLI structure using clap's derive API. The
//! binary has a single mode: run the gateway described by the config
//! file.

use clap::Parser;

/// mcpgate - transport-pluggable MCP gateway runtime
///
/// Routes incoming MCP requests across a fleet of backends over pooled
/// length-prefixed TCP connections.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcpgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MCPGATE_CONFIG")]
    pub config: Option<String>,

    /// Log filter override (e.g. "mcpgate=debug")
    #[arg(long, env = "MCPGATE_LOG")]
    pub log: Option<String>,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_no_args() {
        let cli = Cli::parse_from(["mcpgate"]);
        assert!(cli.config.is_none());
        assert!(cli.log.is_none());
    }

    #[test]
    fn test_config_flag_parsed() {
        let cli = Cli::parse_from(["mcpgate", "--config", "/etc/mcpgate.yaml"]);
        assert_eq!(cli.config.as_deref(), Some("/etc/mcpgate.yaml"));
    }
}
