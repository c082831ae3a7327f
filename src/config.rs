//! # Configuration Management
//!
//! Centralized configuration for the protocol engine.
//!
//! This module provides structured configuration for the client session,
//! server discovery, transports and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides (`CM_PROTOCOL_*` variables) via `from_env()`
//!
//! Account credentials and logon protocol versions are never part of the
//! configuration; callers supply them per logon.

use crate::core::emsg::Universe;
use crate::error::{ProtocolError, Result};
use crate::transport::TransportKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed payload size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Client session configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Server discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Transport configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(servers) = std::env::var("CM_PROTOCOL_SEED_SERVERS") {
            config.discovery.seed_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Ok(kind) = std::env::var("CM_PROTOCOL_TRANSPORT") {
            config.transport.kind = match kind.to_ascii_lowercase().as_str() {
                "tcp" => TransportKind::Tcp,
                "udp" => TransportKind::Udp,
                "websocket" | "ws" => TransportKind::WebSocket,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Unknown transport in CM_PROTOCOL_TRANSPORT: {other}"
                    )))
                }
            };
        }

        if let Ok(timeout) = std::env::var("CM_PROTOCOL_CONNECTION_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.connection_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(timeout) = std::env::var("CM_PROTOCOL_JOB_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.client.job_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(window) = std::env::var("CM_PROTOCOL_DISCOVERY_WINDOW_MS") {
            if let Ok(val) = window.parse::<u64>() {
                config.discovery.window = Duration::from_millis(val);
            }
        }

        if let Ok(reconnect) = std::env::var("CM_PROTOCOL_AUTO_RECONNECT") {
            if let Ok(val) = reconnect.parse::<bool>() {
                config.client.auto_reconnect = val;
            }
        }

        if let Ok(path) = std::env::var("CM_PROTOCOL_SERVER_STORE") {
            config.discovery.store_path = Some(path);
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.discovery.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Client session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Universe the client expects the servers to belong to
    pub universe: Universe,

    /// Timeout for opening a transport to the selected server
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How long a job waits for its reply
    #[serde(with = "duration_serde")]
    pub job_timeout: Duration,

    /// Heartbeat interval used when the logon response does not carry one
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Whether to automatically reconnect on connection loss
    pub auto_reconnect: bool,

    /// Maximum number of reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// First delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,

    /// Upper bound for the reconnect backoff
    #[serde(with = "duration_serde")]
    pub max_reconnect_delay: Duration,

    /// Capacity of the command and event channels
    pub channel_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            universe: Universe::Public,
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            job_timeout: timeout::JOB_TIMEOUT,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            channel_capacity: 64,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.universe == Universe::Invalid {
            errors.push("Universe must not be Invalid".to_string());
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.job_timeout.as_millis() < 100 {
            errors.push("Job timeout too short (minimum: 100ms)".to_string());
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.auto_reconnect && self.max_reconnect_attempts == 0 {
            errors.push(
                "Max reconnect attempts must be greater than 0 when auto_reconnect is enabled"
                    .to_string(),
            );
        }

        if self.reconnect_delay.as_millis() < 10 {
            errors.push("Reconnect delay too short (minimum: 10ms)".to_string());
        } else if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        if self.max_reconnect_delay < self.reconnect_delay {
            errors.push("Max reconnect delay cannot be shorter than reconnect delay".to_string());
        }

        if self.channel_capacity == 0 {
            errors.push("Channel capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// Server discovery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Bootstrap servers as `host:port`, used until a list is learned
    pub seed_servers: Vec<String>,

    /// Bootstrap WebSocket hosts as `host[:port]`
    #[serde(default)]
    pub seed_websocket_servers: Vec<String>,

    /// How long load replies are collected before picking a server
    #[serde(with = "duration_serde")]
    pub window: Duration,

    /// Extra discovery rounds after the first before the connect fails
    pub max_retries: u32,

    /// Delay before the first discovery retry
    #[serde(with = "duration_serde")]
    pub retry_delay: Duration,

    /// File the learned server list is persisted to
    #[serde(default)]
    pub store_path: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seed_servers: Vec::new(),
            seed_websocket_servers: Vec::new(),
            window: Duration::from_millis(500),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            store_path: None,
        }
    }
}

impl DiscoveryConfig {
    /// Validate discovery configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for server in &self.seed_servers {
            if server.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                errors.push(format!(
                    "Invalid seed server format: '{server}' (expected format: 'host:port')"
                ));
            }
        }

        for server in &self.seed_websocket_servers {
            if server.is_empty() {
                errors.push("WebSocket seed host cannot be empty".to_string());
            }
        }

        if self.window.as_millis() < 10 {
            errors.push("Discovery window too short (minimum: 10ms)".to_string());
        } else if self.window.as_secs() > 60 {
            errors.push("Discovery window too long (maximum: 60s)".to_string());
        }

        if self.max_retries > 100 {
            errors.push(format!(
                "Discovery retries too high: {} (maximum: 100)",
                self.max_retries
            ));
        }

        if let Some(ref path) = self.store_path {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    errors.push(format!(
                        "Server store directory does not exist: {}",
                        parent.display()
                    ));
                }
            }
        }

        errors
    }
}

/// Transport configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Transport used to reach the servers
    pub kind: TransportKind,

    /// Maximum allowed payload size in bytes
    pub max_payload_size: usize,

    /// Frames buffered in each direction of a channel
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Tcp,
            max_payload_size: MAX_PAYLOAD_SIZE,
            channel_capacity: 128,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_payload_size == 0 {
            errors.push("Max payload size cannot be 0".to_string());
        } else if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > MAX_PAYLOAD_SIZE {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum: {} bytes)",
                self.max_payload_size, MAX_PAYLOAD_SIZE
            ));
        }

        if self.channel_capacity == 0 {
            errors.push("Channel capacity must be greater than 0".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("cm-protocol"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
