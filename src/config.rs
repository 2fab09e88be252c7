// Configuration File Support
//
// TOML configuration with environment variable overrides.
// The file is read from --config, then HOOKRELAY_CONFIG, then ./hookrelay.toml.
// A missing file means defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::webhooks::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// HTTP API listener
    pub server: ServerConfig,

    /// Outbound delivery settings
    pub delivery: DeliveryConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,

    /// Bearer credentials
    pub auth: AuthConfig,
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

/// HTTP API listener configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
        }
    }
}

/// Outbound delivery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Timeout for one outbound POST in seconds
    pub timeout_secs: u64,

    /// Characters of the receiver's response body kept on the delivery
    pub response_body_limit: usize,

    /// Concurrent dispatches
    pub workers: usize,

    /// User-Agent sent with every delivery
    pub user_agent: String,

    /// Backoff and attempt limit
    pub retry: RetryPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            response_body_limit: 1000,
            workers: 4,
            user_agent: format!("hookrelay/{}", env!("CARGO_PKG_VERSION")),
            retry: RetryPolicy::default(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether to serve metrics
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

/// Static bearer token table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenConfig>,
}

/// One accepted bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenConfig {
    pub token: String,

    /// Person the token acts as
    pub subject: uuid::Uuid,

    /// Granted scopes (read, write, admin)
    #[serde(default)]
    pub scopes: Vec<String>,

    /// Platform manager: may manage every endpoint
    #[serde(default)]
    pub manager: bool,
}

impl Config {
    /// Load configuration from an explicit path or the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or
    /// fails validation. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path(),
        };
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
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
        config.validate()?;
        Ok(config)
    }

    /// Default configuration file path
    pub fn config_path() -> PathBuf {
        std::env::var("HOOKRELAY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("hookrelay.toml"))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - HOOKRELAY_LOG_LEVEL
    /// - HOOKRELAY_LOG_FORMAT
    /// - HOOKRELAY_HOST
    /// - HOOKRELAY_PORT
    /// - HOOKRELAY_MAX_ATTEMPTS
    /// - HOOKRELAY_DELIVERY_TIMEOUT_SECS
    /// - HOOKRELAY_WORKERS
    /// - HOOKRELAY_METRICS_ENABLED
    /// - HOOKRELAY_METRICS_PORT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("HOOKRELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("HOOKRELAY_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(host) = std::env::var("HOOKRELAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("HOOKRELAY_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(attempts) = std::env::var("HOOKRELAY_MAX_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse::<u32>() {
                if attempts > 0 {
                    self.delivery.retry.max_attempts = attempts;
                }
            }
        }
        if let Ok(timeout) = std::env::var("HOOKRELAY_DELIVERY_TIMEOUT_SECS") {
            if let Ok(timeout) = timeout.parse::<u64>() {
                if timeout > 0 {
                    self.delivery.timeout_secs = timeout;
                }
            }
        }
        if let Ok(workers) = std::env::var("HOOKRELAY_WORKERS") {
            if let Ok(workers) = workers.parse::<usize>() {
                if workers > 0 {
                    self.delivery.workers = workers;
                }
            }
        }

        if let Ok(enabled) = std::env::var("HOOKRELAY_METRICS_ENABLED") {
            self.metrics.enabled = enabled.parse().unwrap_or(self.metrics.enabled);
        }
        if let Ok(port) = std::env::var("HOOKRELAY_METRICS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.metrics.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.delivery.retry.max_attempts == 0 {
            anyhow::bail!("delivery.retry.max_attempts must be > 0");
        }
        if self.delivery.timeout_secs == 0 || self.delivery.timeout_secs > 60 {
            anyhow::bail!("delivery.timeout_secs must be between 1 and 60");
        }
        if self.delivery.workers == 0 {
            anyhow::bail!("delivery.workers must be > 0");
        }
        if self.delivery.retry.max_delay_ms < self.delivery.retry.base_delay_ms {
            anyhow::bail!("delivery.retry.max_delay_ms must be >= base_delay_ms");
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("Metrics port must be > 0");
        }

        for (i, token) in self.auth.tokens.iter().enumerate() {
            if token.token.is_empty() {
                anyhow::bail!("auth.tokens[{}] has an empty token", i);
            }
            for scope in &token.scopes {
                match scope.as_str() {
                    "read" | "write" | "admin" => {}
                    _ => anyhow::bail!(
                        "auth.tokens[{}] has invalid scope: {}. Must be one of: read, write, admin",
                        i,
                        scope
                    ),
                }
            }
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }
}
