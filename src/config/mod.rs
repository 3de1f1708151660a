//! Configuration management for the registrar pipeline
//!
//! This module handles loading and validating configuration from TOML files
//! and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{SYSTEM_ACTOR, SYSTEM_USER_ID};

const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5_000;
const DEFAULT_ANNOUNCEMENT_INTERVAL_MS: u64 = 20_000;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Scheduling and announcement settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How often buffered heartbeats are persisted
    pub flush_interval_ms: u64,

    /// How often unannounced applications are scanned
    pub announcement_interval_ms: u64,

    /// Run one last flush when the pipeline shuts down
    pub flush_on_shutdown: bool,

    /// Actor recorded on emitted events
    pub system_actor: String,

    /// User id recorded on emitted events
    pub system_user_id: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            announcement_interval_ms: DEFAULT_ANNOUNCEMENT_INTERVAL_MS,
            flush_on_shutdown: true,
            system_actor: SYSTEM_ACTOR.to_string(),
            system_user_id: SYSTEM_USER_ID,
        }
    }
}

impl PipelineConfig {
    /// Create a new config builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn announcement_interval(&self) -> Duration {
        Duration::from_millis(self.announcement_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::invalid("flush_interval_ms", "Must be greater than 0"));
        }

        if self.announcement_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "announcement_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.announcement_interval_ms < self.flush_interval_ms {
            return Err(ConfigError::invalid(
                "announcement_interval_ms",
                "Must not be shorter than flush_interval_ms",
            ));
        }

        if self.system_actor.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "system_actor".to_string(),
            });
        }

        Ok(())
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    flush_interval: Option<Duration>,
    announcement_interval: Option<Duration>,
    flush_on_shutdown: Option<bool>,
    system_actor: Option<String>,
    system_user_id: Option<i64>,
}

impl PipelineConfigBuilder {
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn announcement_interval(mut self, interval: Duration) -> Self {
        self.announcement_interval = Some(interval);
        self
    }

    pub fn flush_on_shutdown(mut self, enabled: bool) -> Self {
        self.flush_on_shutdown = Some(enabled);
        self
    }

    pub fn system_actor(mut self, actor: impl Into<String>) -> Self {
        self.system_actor = Some(actor.into());
        self
    }

    pub fn system_user_id(mut self, id: i64) -> Self {
        self.system_user_id = Some(id);
        self
    }

    /// Build the config
    pub fn build(self) -> Result<PipelineConfig, ConfigError> {
        let defaults = PipelineConfig::default();
        let config = PipelineConfig {
            flush_interval_ms: self
                .flush_interval
                .map_or(defaults.flush_interval_ms, |d| d.as_millis() as u64),
            announcement_interval_ms: self
                .announcement_interval
                .map_or(defaults.announcement_interval_ms, |d| d.as_millis() as u64),
            flush_on_shutdown: self.flush_on_shutdown.unwrap_or(defaults.flush_on_shutdown),
            system_actor: self.system_actor.unwrap_or(defaults.system_actor),
            system_user_id: self.system_user_id.unwrap_or(defaults.system_user_id),
        };

        config.validate()?;
        Ok(config)
    }
}

/// Which backend holds applications, instances and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Sqlite,
    Postgres,
}

impl std::str::FromStr for StorageBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(ConfigError::invalid(
                "backend",
                format!("Unknown storage backend '{other}'"),
            )),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    /// SQLite database path
    pub sqlite_path: PathBuf,

    /// PostgreSQL connection string
    pub postgres_url: String,

    /// Maximum pool size
    pub pool_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_path: PathBuf::from("data/registrar.db"),
            postgres_url: String::from("postgresql://localhost/registrar"),
            pool_size: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load from `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `REGISTRAR_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = env_parse("REGISTRAR_FLUSH_INTERVAL_MS") {
            self.pipeline.flush_interval_ms = ms;
        }
        if let Some(ms) = env_parse("REGISTRAR_ANNOUNCE_INTERVAL_MS") {
            self.pipeline.announcement_interval_ms = ms;
        }
        if let Ok(backend) = std::env::var("REGISTRAR_STORAGE") {
            self.storage.backend = backend
                .parse()
                .with_context(|| format!("Invalid REGISTRAR_STORAGE value: {backend}"))?;
        }
        if let Ok(path) = std::env::var("REGISTRAR_SQLITE_PATH") {
            self.storage.sqlite_path = path.into();
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.storage.postgres_url = url;
        }
        if let Some(size) = env_parse("REGISTRAR_POOL_SIZE") {
            self.storage.pool_size = size;
        }
        if let Ok(level) = std::env::var("REGISTRAR_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("REGISTRAR_LOG_FORMAT") {
            self.logging.format = format;
        }
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;

        if self.storage.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("log format must be 'text' or 'json', got '{}'", self.logging.format);
        }

        Ok(())
    }
}
