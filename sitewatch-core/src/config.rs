use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Shared secret the stock camera clients ship with; accepted but warned about
pub const DEFAULT_RELAY_TOKEN: &str = "StrongPassword123";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
        }
    }
}

/// Camera relay tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Shared secret every relay client must present as `?token=`
    pub token: String,
    /// Close a connection after this long without any inbound traffic
    pub liveness_timeout_seconds: u64,
    /// Frames buffered per viewer before new frames are dropped
    pub viewer_queue_capacity: usize,
    /// Control replies buffered per sender
    pub sender_queue_capacity: usize,
    /// A sender silent for this long may be replaced by a reconnecting sender
    pub sender_reclaim_after_seconds: u64,
    /// Largest accepted WebSocket message, in bytes
    pub max_message_size: usize,
    /// How long shutdown waits for sessions to tear down
    pub shutdown_drain_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            token: DEFAULT_RELAY_TOKEN.to_string(),
            liveness_timeout_seconds: 20,
            viewer_queue_capacity: 32,
            sender_queue_capacity: 16,
            sender_reclaim_after_seconds: 10,
            max_message_size: 8 * 1024 * 1024,
            shutdown_drain_seconds: 5,
        }
    }
}

/// Out-of-band stats reporting for split deployments
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Status API endpoint receiving `update_stats` pushes; disabled when unset
    pub report_url: Option<String>,
    pub report_interval_seconds: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_url: None,
            report_interval_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // SITEWATCH_RELAY__TOKEN, SITEWATCH_SERVER__PORT, ...
        builder = builder.add_source(
            Environment::with_prefix("SITEWATCH")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check for misconfigurations, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.host.trim().is_empty() {
            errors.push("server.host must not be empty".to_string());
        }
        if self.relay.token.is_empty() {
            errors.push("relay.token must not be empty".to_string());
        }
        if self.relay.liveness_timeout_seconds == 0 {
            errors.push("relay.liveness_timeout_seconds must be greater than 0".to_string());
        }
        if self.relay.viewer_queue_capacity == 0 {
            errors.push("relay.viewer_queue_capacity must be greater than 0".to_string());
        }
        if self.relay.sender_queue_capacity == 0 {
            errors.push("relay.sender_queue_capacity must be greater than 0".to_string());
        }
        if self.relay.max_message_size < 1024 {
            errors.push("relay.max_message_size must be at least 1024 bytes".to_string());
        }
        if self.stats.report_url.is_some() && self.stats.report_interval_seconds == 0 {
            errors.push("stats.report_interval_seconds must be greater than 0".to_string());
        }
        if let Some(url) = &self.stats.report_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                errors.push(format!("stats.report_url must be an http(s) URL, got {url}"));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got {}",
                self.logging.format
            ));
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level is invalid: {}", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// [`Config::validate`] folded into a single error
    pub fn ensure_valid(&self) -> crate::Result<()> {
        self.validate()
            .map_err(|errors| crate::Error::InvalidInput(errors.join("; ")))
    }

    /// Whether the relay still runs with the well-known default secret
    #[must_use]
    pub fn uses_default_token(&self) -> bool {
        self.relay.token == DEFAULT_RELAY_TOKEN
    }

    /// Get listen address
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Public URL dashboards use to reach the relay
    #[must_use]
    pub fn websocket_url(&self) -> String {
        format!("ws://{}", self.listen_address())
    }
}
