//! Configuration management

use crate::protocol::{
    ANNOUNCE_INTERVAL, CHANNEL_TTL, DEFAULT_TOKEN, PRUNE_INTERVAL, READ_DEADLINE, RECONNECT_TIME,
    WRITE_DEADLINE,
};
use crate::transport::{MemoryTransport, Transport, TransportConfig};
use crate::tunnel::{LinkOptions, TunnelOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Tunnel configuration
    pub tunnel: TunnelConfig,
    /// Link timings
    pub link: LinkConfig,
    /// Logging configuration
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

    /// Build runtime tunnel options
    pub fn tunnel_options(&self) -> Result<TunnelOptions, crate::Error> {
        let mut options = TunnelOptions::default();

        if let Some(id) = self.tunnel.id.as_ref().filter(|id| !id.is_empty()) {
            options.id = id.clone();
        }
        options.address = self.tunnel.address.clone();
        options.nodes = self.tunnel.nodes.clone();
        options.token = self.tunnel.token.clone();
        options.transport = self.transport()?;
        options.link = self.link.link_options();
        options.reconnect_time = Duration::from_millis(self.tunnel.reconnect_ms);
        options.announce_interval = Duration::from_millis(self.tunnel.announce_ms);

        options
            .validate()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(options)
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, crate::Error> {
        if self.link.connect_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "connect_timeout_ms must be non-zero".to_string(),
            ));
        }

        match self.tunnel.transport.to_lowercase().as_str() {
            #[cfg(feature = "tcp")]
            "tcp" => Ok(Arc::new(crate::transport::TcpTransport::new(TransportConfig {
                connect_timeout_ms: self.link.connect_timeout_ms,
                ..TransportConfig::default()
            }))),
            "memory" => Ok(Arc::new(MemoryTransport::new())),
            other => Err(crate::Error::Config(format!("Unknown transport: {}", other))),
        }
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Tunnel id (random when unset)
    pub id: Option<String>,
    /// Listen address
    pub address: String,
    /// Seed nodes to keep links to
    pub nodes: Vec<String>,
    /// Shared network token
    pub token: String,
    /// Transport backend (tcp, memory)
    pub transport: String,
    /// Backoff before redialing a lost node
    pub reconnect_ms: u64,
    /// How often listening channels are announced
    pub announce_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            id: None,
            address: "0.0.0.0:8085".to_string(),
            nodes: Vec::new(),
            token: DEFAULT_TOKEN.to_string(),
            transport: "tcp".to_string(),
            reconnect_ms: RECONNECT_TIME.as_millis() as u64,
            announce_ms: ANNOUNCE_INTERVAL.as_millis() as u64,
        }
    }
}

/// Link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub read_deadline_ms: u64,
    pub write_deadline_ms: u64,
    pub prune_interval_ms: u64,
    pub channel_ttl_ms: u64,
    /// Transport connect timeout
    pub connect_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_deadline_ms: READ_DEADLINE.as_millis() as u64,
            write_deadline_ms: WRITE_DEADLINE.as_millis() as u64,
            prune_interval_ms: PRUNE_INTERVAL.as_millis() as u64,
            channel_ttl_ms: CHANNEL_TTL.as_millis() as u64,
            connect_timeout_ms: TransportConfig::default().connect_timeout_ms,
        }
    }
}

impl LinkConfig {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            read_deadline: Duration::from_millis(self.read_deadline_ms),
            write_deadline: Duration::from_millis(self.write_deadline_ms),
            prune_interval: Duration::from_millis(self.prune_interval_ms),
            channel_ttl: Duration::from_millis(self.channel_ttl_ms),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        tunnel: TunnelConfig {
            id: Some("node-1".to_string()),
            nodes: vec!["10.0.0.2:8085".to_string(), "10.0.0.3:8085".to_string()],
            token: "change-me".to_string(),
            ..TunnelConfig::default()
        },
        link: LinkConfig::default(),
        logging: LoggingConfig::default(),
    }
}
