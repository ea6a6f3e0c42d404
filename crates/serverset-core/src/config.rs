//! Configuration management for serverset discovery.
//!
//! This module provides the configuration system used by the binary and the
//! discovery engine:
//! - Loading from YAML files
//! - Environment variable overrides (`SERVERSET_SD__...`)
//! - Validation of all settings

use crate::error::{ConfigError, Result};
use crate::types::ServerEnsemble;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Main application configuration.
///
/// # Examples
///
/// ```no_run
/// use serverset_core::config::AppConfig;
///
/// let config = AppConfig::from_file("config.yaml").unwrap();
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Serverset discovery settings
    #[serde(default)]
    pub serverset: ServersetConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate, layering
    /// `SERVERSET_SD__SECTION__FIELD` environment variables over the file.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or merged.
    pub fn from_config_builder<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .add_source(
                config::Environment::with_prefix("SERVERSET_SD")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("serverset.servers")
                    .with_list_parse_key("serverset.paths")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self) -> Result<()> {
        self.serverset.validate()?;
        self.logging.parse_level()?;
        Ok(())
    }
}

/// Settings of one serverset discovery instance: a single ensemble and the
/// root paths watched on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServersetConfig {
    /// Ordered coordination-store server addresses
    #[serde(default)]
    pub servers: Vec<String>,

    /// Root paths to watch, one source each
    #[serde(default)]
    pub paths: Vec<String>,

    /// Timeout applied to every store operation (seconds)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Name prefix of member nodes
    #[serde(default = "default_member_prefix")]
    pub member_prefix: String,

    /// Capacity of the coordinator's update queue
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Retry policy for transient store failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ServersetConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            paths: Vec::new(),
            timeout_secs: default_timeout(),
            member_prefix: default_member_prefix(),
            queue_depth: default_queue_depth(),
            retry: RetryConfig::default(),
        }
    }
}

impl ServersetConfig {
    /// Creates a configuration for `servers` watching `paths`, with defaults
    /// for everything else.
    pub fn new<S, P>(servers: S, paths: P) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        P: IntoIterator,
        P::Item: Into<String>,
    {
        Self {
            servers: servers.into_iter().map(Into::into).collect(),
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Returns the store operation timeout as a Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Builds the ensemble these settings describe.
    pub fn ensemble(&self) -> ServerEnsemble {
        ServerEnsemble::new(self.servers.clone(), self.timeout())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers.into());
        }

        if self.paths.is_empty() {
            return Err(ConfigError::NoPaths.into());
        }

        let mut seen = HashSet::new();
        for path in &self.paths {
            validate_path(path)?;
            if !seen.insert(path.as_str()) {
                return Err(ConfigError::DuplicatePath { path: path.clone() }.into());
            }
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::invalid_value("serverset.timeout_secs", "cannot be 0").into());
        }

        if self.queue_depth == 0 {
            return Err(ConfigError::invalid_value("serverset.queue_depth", "cannot be 0").into());
        }

        if self.member_prefix.is_empty() {
            return Err(
                ConfigError::invalid_value("serverset.member_prefix", "cannot be empty").into(),
            );
        }

        self.retry.validate()
    }
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ConfigError::invalid_path(path, "must start with '/'").into());
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(ConfigError::invalid_path(path, "must not end with '/'").into());
    }
    if path.contains("//") {
        return Err(ConfigError::invalid_path(path, "contains an empty segment").into());
    }
    Ok(())
}

/// Exponential backoff applied while a source retries after a transient
/// store failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the delay between retries (milliseconds)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Consecutive failed attempts before the connection is considered lost
    /// for good (None = retry forever)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero based), capped at the maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let backoff_ms =
            self.initial_backoff_ms as f64 * self.multiplier.powi(attempt.min(64) as i32);
        let capped_ms = backoff_ms.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped_ms.round() as u64)
    }

    /// Returns true once `failures` consecutive failures exhaust the policy.
    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }

    /// Validates the retry policy.
    pub fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(
                ConfigError::invalid_value("serverset.retry.multiplier", "must be >= 1.0").into(),
            );
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::invalid_value(
                "serverset.retry.max_backoff_ms",
                "must be >= initial_backoff_ms",
            )
            .into());
        }
        if self.max_attempts == Some(0) {
            return Err(
                ConfigError::invalid_value("serverset.retry.max_attempts", "cannot be 0").into(),
            );
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                reason: format!("Invalid log level: {}", self.level),
            }
            .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}

// Default configuration values
fn default_timeout() -> u64 {
    10
}

fn default_member_prefix() -> String {
    "member_".to_string()
}

fn default_queue_depth() -> usize {
    64
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> Option<u32> {
    Some(10)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}
