// Configuration File Support
//
// TOML configuration for the forwarding agent with environment variable
// overrides. The default file lives in the platform config directory,
// e.g. ~/.config/courier/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::credentials::Credential;
use crate::delivery::RetryPolicy;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "COURIER_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Local gateway listener
    pub agent: AgentConfig,

    /// Upstream server connection
    pub upstream: UpstreamConfig,

    /// Static credentials, used alongside (or instead of) synced ones
    pub credentials: Vec<Credential>,

    /// Offline buffering
    pub buffer: BufferConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Local HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9000,
        }
    }
}

/// Upstream connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL of the ingestion server (required)
    pub server_url: String,

    /// Token for credential sync. Sync is disabled when unset.
    pub agent_token: Option<String>,

    pub sync_interval_secs: u64,

    /// Per-request timeout
    pub timeout_secs: u64,

    /// Delivery attempts per send, including the first
    pub retry_attempts: u32,

    /// Fixed pause between attempts
    pub retry_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            agent_token: None,
            sync_interval_secs: 60,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_ms: 5000,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_delay_ms))
    }

    /// Auto-sync runs only with a non-empty agent token
    pub fn has_auto_sync(&self) -> bool {
        self.agent_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Offline buffer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub enabled: bool,

    /// Queue capacity in messages
    pub max_size: usize,

    /// SQLite database file
    pub db_path: PathBuf,

    pub drain_interval_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 10_000,
            db_path: PathBuf::from("./queue.db"),
            drain_interval_secs: 10,
        }
    }
}

impl BufferConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve /metrics
    pub enabled: bool,

    /// Port for metrics server
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default config directory
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// A missing file is not an error: defaults plus environment overrides
    /// are used instead. The result is always validated.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// final configuration is invalid.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config
            .validate()
            .with_context(|| format!("Invalid configuration ({:?})", path))?;

        Ok(config)
    }

    /// Get the default configuration file path
    ///
    /// Returns `~/.config/courier/config.toml` on Linux
    pub fn config_path() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("dev", "courier", "courier") {
            proj_dirs.config_dir().join("config.toml")
        } else {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("courier").join("config.toml")
        }
    }

    /// Apply `COURIER_*` environment variable overrides
    ///
    /// - COURIER_LOG_LEVEL, COURIER_LOG_FORMAT
    /// - COURIER_SERVER_URL, COURIER_AGENT_TOKEN
    /// - COURIER_PORT
    /// - COURIER_BUFFER_DB_PATH, COURIER_BUFFER_MAX_SIZE
    /// - COURIER_METRICS_ENABLED, COURIER_METRICS_PORT
    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(format!("{ENV_PREFIX}{name}")).ok())
    }

    /// Overrides from any lookup keyed by the unprefixed variable name.
    /// Unparseable numeric values are ignored.
    fn apply_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Logging overrides
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format;
        }

        // Upstream overrides
        if let Some(url) = lookup("SERVER_URL") {
            self.upstream.server_url = url;
        }
        if let Some(token) = lookup("AGENT_TOKEN") {
            self.upstream.agent_token = Some(token);
        }

        // Gateway
        if let Some(port) = lookup("PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.agent.port = port;
        }

        // Buffer overrides
        if let Some(path) = lookup("BUFFER_DB_PATH") {
            self.buffer.db_path = PathBuf::from(path);
        }
        if let Some(size) = lookup("BUFFER_MAX_SIZE").and_then(|s| s.parse::<usize>().ok()) {
            if size > 0 {
                self.buffer.max_size = size;
            }
        }

        // Metrics overrides
        if let Some(enabled) = lookup("METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Some(port) = lookup("METRICS_PORT").and_then(|p| p.parse::<u16>().ok()) {
            self.metrics.port = port;
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        // Validate logging level
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}. Must be one of: trace, debug, info, warn, error", self.logging.level),
        }

        // Validate logging format
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!("Invalid log format: {}. Must be one of: json, pretty, compact", self.logging.format),
        }

        // Validate upstream
        let url = self.upstream.server_url.trim();
        if url.is_empty() {
            anyhow::bail!("upstream.server_url is required");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("upstream.server_url must start with http:// or https://: {}", url);
        }
        if !self.upstream.has_auto_sync() && self.credentials.is_empty() {
            anyhow::bail!("Either upstream.agent_token or at least one [[credentials]] entry must be configured");
        }
        if self.upstream.retry_attempts == 0 {
            anyhow::bail!("upstream.retry_attempts must be >= 1");
        }
        if self.upstream.timeout_secs == 0 {
            anyhow::bail!("upstream.timeout_secs must be >= 1");
        }
        if self.upstream.has_auto_sync() && self.upstream.sync_interval_secs == 0 {
            anyhow::bail!("upstream.sync_interval_secs must be >= 1");
        }

        // Validate static credentials
        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.tenant_key.is_empty() {
                anyhow::bail!("Credential '{}' has an empty tenant_key", credential.name);
            }
            if credential.secret.is_empty() {
                anyhow::bail!("Credential '{}' has an empty secret", credential.tenant_key);
            }
            if !seen.insert(credential.tenant_key.as_str()) {
                anyhow::bail!("Duplicate credential tenant_key: {}", credential.tenant_key);
            }
        }

        // Validate buffer
        if self.buffer.max_size == 0 {
            anyhow::bail!("buffer.max_size must be >= 1");
        }
        if self.buffer.drain_interval_secs == 0 {
            anyhow::bail!("buffer.drain_interval_secs must be >= 1");
        }
        if self.buffer.enabled && self.buffer.db_path.as_os_str().is_empty() {
            anyhow::bail!("buffer.db_path must be set when buffering is enabled");
        }

        // Validate metrics configuration
        if self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging.level.to_lowercase().parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Queued messages are dropped once their stored attempt count reaches this
    pub fn queue_drop_ceiling(&self) -> u32 {
        self.upstream.retry_policy().queue_drop_ceiling()
    }
}
