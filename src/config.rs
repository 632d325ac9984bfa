//! Configuration module for Nexbus
//!
//! JSON configuration for the daemon: listen specs, connection limits for
//! the TCP transport, and name-service properties.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Globally unique daemon id. Generated when absent.
    #[serde(default)]
    pub guid: Option<Uuid>,

    /// Listen specs the daemon brings up at start,
    /// e.g. "tcp:addr=0.0.0.0,port=9955"
    #[serde(default)]
    pub listen: Vec<String>,

    /// Well-known names to advertise at start
    #[serde(default)]
    pub advertise: Vec<String>,

    /// Name prefixes to discover at start
    #[serde(default)]
    pub discover: Vec<String>,

    /// Connection limits for the TCP transport
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Name-service properties
    #[serde(default)]
    pub name_service: NameServiceConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default daemon configuration
    pub fn default_daemon() -> Self {
        Config {
            log: LogConfig::default(),
            guid: None,
            listen: vec!["tcp:addr=0.0.0.0,port=9955".to_string()],
            advertise: Vec::new(),
            discover: Vec::new(),
            limits: LimitsConfig::default(),
            name_service: NameServiceConfig::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_daemon()
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Connection limits for the TCP transport.
///
/// Key names follow the daemon configuration database they came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Milliseconds an inbound connection may spend authenticating before
    /// it is treated as a denial-of-service attempt and dropped.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout: u64,

    /// Maximum number of inbound connections concurrently authenticating.
    #[serde(default = "default_max_incomplete")]
    pub max_incomplete_connections_tcp: usize,

    /// Maximum number of connections this transport holds in total.
    #[serde(default = "default_max_completed")]
    pub max_completed_connections_tcp: usize,
}

fn default_auth_timeout_ms() -> u64 {
    20_000
}

fn default_max_incomplete() -> usize {
    10
}

fn default_max_completed() -> usize {
    50
}

impl LimitsConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            auth_timeout: default_auth_timeout_ms(),
            max_incomplete_connections_tcp: default_max_incomplete(),
            max_completed_connections_tcp: default_max_completed(),
        }
    }
}

/// Name-service properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServiceConfig {
    /// Comma-separated interface names or IP literals the name service
    /// runs over; `*` is the wildcard and the default.
    #[serde(default = "default_interfaces")]
    pub interfaces: String,

    /// Disable IPv4 broadcast announcements.
    #[serde(default)]
    pub disable_broadcast: bool,

    #[serde(default = "default_true")]
    pub enable_ipv4: bool,

    #[serde(default = "default_true")]
    pub enable_ipv6: bool,
}

fn default_interfaces() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for NameServiceConfig {
    fn default() -> Self {
        Self {
            interfaces: default_interfaces(),
            disable_broadcast: false,
            enable_ipv4: true,
            enable_ipv6: true,
        }
    }
}
