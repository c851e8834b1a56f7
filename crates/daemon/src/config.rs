//! Daemon configuration.
//!
//! Loaded from a JSON file (`configs/config.json` by convention); every
//! field has a default so a missing file or section still yields a usable
//! configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::policy::DEFAULT_TIMEOUT_MS;

/// Top-level configuration for the negotiation daemon.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
}

/// Socket endpoints.
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,
    #[serde(default = "default_socket_path")]
    pub unix_socket_path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            unix_socket_path: default_socket_path(),
        }
    }
}

/// Handshake timing.
#[derive(Debug, Deserialize, Clone)]
pub struct NegotiationConfig {
    /// Fallback session timeout, also the receive-loop wait bound.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u32,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_udp_port() -> u16 {
    5000
}

fn default_socket_path() -> String {
    "/tmp/negotio.sock".to_string()
}

fn default_timeout_ms() -> u32 {
    DEFAULT_TIMEOUT_MS
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context(format!("failed to read config file {:?}", path.as_ref()))?;
        let config: Config =
            serde_json::from_str(&content).context("failed to parse JSON config")?;
        Ok(config)
    }

    /// Load from the conventional paths, or fall back to defaults.
    pub fn load_or_default() -> Self {
        let paths = [
            "/etc/negotio/config.json",
            "configs/config.json",
            "./config.json",
        ];
        for path in &paths {
            if Path::new(path).exists() {
                if let Ok(config) = Self::load(path) {
                    return config;
                }
            }
        }
        Self::default()
    }
}
