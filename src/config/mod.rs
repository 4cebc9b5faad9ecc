//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Gateway server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Flow-control tuning
    #[serde(default)]
    pub flow: FlowConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// HTTP upgrade path accepted for tunnel connections; everything
    /// else is rejected
    pub upgrade_path: String,
    /// Maximum concurrent tunnel connections
    pub max_connections: usize,
    /// Maximum concurrent streams per connection
    pub max_streams: usize,
    /// Whether UDP streams are permitted
    pub allow_udp: bool,
    /// Outbound dial timeout in seconds
    pub dial_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", crate::DEFAULT_PORT),
            upgrade_path: "/wisp/".to_string(),
            max_connections: 1000,
            max_streams: crate::tunnel::DEFAULT_MAX_STREAMS,
            allow_udp: true,
            dial_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

/// Flow-control tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Initial per-stream window granted to clients (bytes)
    pub stream_window: u32,
    /// Cap on buffered-but-unsent outbound bytes per stream
    pub max_buffered: usize,
    /// Frame payload ceiling
    pub max_payload: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            stream_window: crate::tunnel::DEFAULT_STREAM_WINDOW,
            max_buffered: crate::tunnel::DEFAULT_MAX_BUFFERED,
            max_payload: crate::MAX_PAYLOAD_SIZE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}
