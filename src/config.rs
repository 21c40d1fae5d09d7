use std::env;

use crate::error::{HopError, Result};
use crate::route::Route;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Serve-node specs (whitespace-separated in `SERVE_NODES`)
    pub serve_nodes: Vec<String>,
    /// Chain-node specs in hop order (whitespace-separated in `CHAIN_NODES`)
    pub chain_nodes: Vec<String>,
    /// Per-connect retry budget through the chain
    pub retries: u32,
    /// Routing mark for outbound sockets (Linux)
    pub mark: u32,
    /// Outbound interface to bind
    pub interface: String,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let serve_nodes = split_specs(&get_env_or("SERVE_NODES", ""));
        if serve_nodes.is_empty() {
            return Err(HopError::InvalidConfig(
                "SERVE_NODES must name at least one serve node".into(),
            ));
        }

        Ok(Config {
            serve_nodes,
            chain_nodes: split_specs(&get_env_or("CHAIN_NODES", "")),
            retries: get_env_or("ROUTE_RETRIES", "1").parse().map_err(|_| {
                HopError::InvalidConfig("ROUTE_RETRIES must be a number".into())
            })?,
            mark: get_env_or("ROUTE_MARK", "0").parse().map_err(|_| {
                HopError::InvalidConfig("ROUTE_MARK must be a number".into())
            })?,
            interface: get_env_or("ROUTE_INTERFACE", ""),
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// The route this configuration describes
    pub fn route(&self) -> Route {
        Route {
            serve_nodes: self.serve_nodes.clone(),
            chain_nodes: self.chain_nodes.clone(),
            retries: self.retries,
            mark: self.mark,
            interface: self.interface.clone(),
        }
    }
}

fn split_specs(s: &str) -> Vec<String> {
    s.split_whitespace().map(|s| s.to_string()).collect()
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
