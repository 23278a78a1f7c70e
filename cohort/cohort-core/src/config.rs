//! Configuration for a cohort federation server.
//!
//! This module manages the server configuration file, including:
//! - Configuration file loading, saving, and validation
//! - Environment variable overrides
//! - Atomic configuration updates
//! - Export to TOML for inspection
//!
//! # Configuration Location
//!
//! By default, configuration is stored at `~/.cohort/config.toml`.
//! This can be overridden with the `COHORT_CONFIG_PATH` environment variable.
//!
//! # Example
//!
//! ```no_run
//! use cohort_core::config::CohortConfig;
//!
//! # async fn example() -> cohort_core::Result<()> {
//! let mut config = CohortConfig::load_or_default(None).await?;
//! config.general.server_name = "server-a".to_string();
//! config.save_to_path(&CohortConfig::config_path()?).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{CohortError, Result};
use crate::id::MetadataCollectionId;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Configuration file version
pub const CONFIG_VERSION: &str = "0.1.0";

/// Environment variable names
pub const ENV_CONFIG_PATH: &str = "COHORT_CONFIG_PATH";
pub const ENV_SERVER_NAME: &str = "COHORT_SERVER_NAME";
pub const ENV_METADATA_COLLECTION_ID: &str = "COHORT_METADATA_COLLECTION_ID";
pub const ENV_COHORT_NAME: &str = "COHORT_COHORT_NAME";
pub const ENV_LOG_LEVEL: &str = "COHORT_LOG_LEVEL";
pub const ENV_LOG_FORMAT: &str = "COHORT_LOG_FORMAT";
pub const ENV_MEMBER_TIMEOUT_MS: &str = "COHORT_MEMBER_TIMEOUT_MS";
pub const ENV_GLOBAL_TIMEOUT_MS: &str = "COHORT_GLOBAL_TIMEOUT_MS";
pub const ENV_MAX_FAN_OUT: &str = "COHORT_MAX_FAN_OUT";
pub const ENV_INBOUND_WORKERS: &str = "COHORT_INBOUND_WORKERS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "COHORT_RETRY_MAX_ATTEMPTS";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const VALID_LOG_FORMATS: [&str; 2] = ["pretty", "json"];

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CohortConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// General configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Configuration version for migration support
    pub version: String,
    /// Name of the hosting server
    pub server_name: String,
    /// Metadata collection id of the local repository; generated when empty
    #[serde(default)]
    pub metadata_collection_id: String,
    /// Cohort (event topic) the server joins
    pub cohort_name: String,
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
    /// Log format: pretty or json
    pub log_format: String,
}

/// Enterprise query settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Deadline for a single member's answer
    pub member_timeout_ms: u64,
    /// Deadline for the whole fan-out
    pub global_timeout_ms: u64,
    /// Maximum concurrent member calls
    pub max_fan_out: usize,
}

/// Event exchange settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Number of partitioned inbound workers
    pub inbound_workers: usize,
    /// Deadline for re-fetching an instance from its home after a gap
    pub reconciliation_timeout_ms: u64,
}

/// Retry and escalation settings for unreachable members
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per event publication before it is abandoned
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    /// Consecutive failed contacts before a member is reported degraded
    pub degraded_after_failures: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            server_name: "cohort-server".to_string(),
            metadata_collection_id: String::new(),
            cohort_name: "cohort".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            member_timeout_ms: 2_000,
            global_timeout_ms: 5_000,
            max_fan_out: 16,
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            inbound_workers: 4,
            reconciliation_timeout_ms: 2_000,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
            degraded_after_failures: 3,
        }
    }
}

impl Default for CohortConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            query: QueryConfig::default(),
            exchange: ExchangeConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl QueryConfig {
    pub fn member_timeout(&self) -> Duration {
        Duration::from_millis(self.member_timeout_ms)
    }

    pub fn global_timeout(&self) -> Duration {
        Duration::from_millis(self.global_timeout_ms)
    }
}

impl ExchangeConfig {
    pub fn reconciliation_timeout(&self) -> Duration {
        Duration::from_millis(self.reconciliation_timeout_ms)
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// ============================================================================
// Loading, saving and validation
// ============================================================================

impl CohortConfig {
    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub async fn load_from_path(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| CohortError::config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_toml(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load from `path`, or from the default location, falling back to defaults
    /// when no file exists there
    pub async fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };

        if path.exists() {
            Self::load_from_path(&path).await
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            let mut config = Self::default();
            config.merge_env_vars()?;
            config.validate()?;
            Ok(config)
        }
    }

    /// Parse a TOML document without applying overrides
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CohortError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Save configuration to a specific path atomically
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized or written
    pub async fn save_to_path(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        self.validate()?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    CohortError::config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }

        let content = self.export_toml()?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");

        tokio::fs::write(&temp_path, content)
            .await
            .map_err(|e| CohortError::config(format!("Failed to write config file: {}", e)))?;

        tokio::fs::rename(&temp_path, path)
            .await
            .map_err(|e| CohortError::config(format!("Failed to rename config file: {}", e)))?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Render the configuration as TOML
    pub fn export_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CohortError::config(format!("Failed to serialize config: {}", e)))
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid
    pub fn validate(&self) -> Result<()> {
        if !VALID_LOG_LEVELS.contains(&self.general.log_level.as_str()) {
            return Err(CohortError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.general.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if !VALID_LOG_FORMATS.contains(&self.general.log_format.as_str()) {
            return Err(CohortError::config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.general.log_format,
                VALID_LOG_FORMATS.join(", ")
            )));
        }

        if self.general.server_name.trim().is_empty() {
            return Err(CohortError::config("server_name must not be empty"));
        }

        if self.general.cohort_name.trim().is_empty() {
            return Err(CohortError::config("cohort_name must not be empty"));
        }

        if self.query.member_timeout_ms == 0 {
            return Err(CohortError::config("member_timeout_ms must be greater than 0"));
        }

        if self.query.global_timeout_ms < self.query.member_timeout_ms {
            return Err(CohortError::config(
                "global_timeout_ms cannot be less than member_timeout_ms",
            ));
        }

        if self.query.max_fan_out == 0 {
            return Err(CohortError::config("max_fan_out must be greater than 0"));
        }

        if self.exchange.inbound_workers == 0 {
            return Err(CohortError::config("inbound_workers must be greater than 0"));
        }

        if self.retry.max_attempts == 0 {
            return Err(CohortError::config("max_attempts must be greater than 0"));
        }

        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(CohortError::config(
                "initial_backoff_ms cannot be greater than max_backoff_ms",
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(CohortError::config("multiplier must be at least 1.0"));
        }

        if self.retry.degraded_after_failures == 0 {
            return Err(CohortError::config(
                "degraded_after_failures must be greater than 0",
            ));
        }

        debug!("Configuration validation passed");
        Ok(())
    }

    /// Merge environment variable overrides into the configuration
    ///
    /// # Errors
    ///
    /// Returns an error if environment variables contain invalid values
    pub fn merge_env_vars(&mut self) -> Result<()> {
        debug!("Merging environment variable overrides");

        if let Ok(server_name) = std::env::var(ENV_SERVER_NAME) {
            debug!("Overriding server_name from environment: {}", server_name);
            self.general.server_name = server_name;
        }

        if let Ok(id) = std::env::var(ENV_METADATA_COLLECTION_ID) {
            debug!("Overriding metadata_collection_id from environment: {}", id);
            self.general.metadata_collection_id = id;
        }

        if let Ok(cohort_name) = std::env::var(ENV_COHORT_NAME) {
            debug!("Overriding cohort_name from environment: {}", cohort_name);
            self.general.cohort_name = cohort_name;
        }

        if let Ok(log_level) = std::env::var(ENV_LOG_LEVEL) {
            debug!("Overriding log_level from environment: {}", log_level);
            self.general.log_level = log_level;
        }

        if let Ok(log_format) = std::env::var(ENV_LOG_FORMAT) {
            debug!("Overriding log_format from environment: {}", log_format);
            self.general.log_format = log_format;
        }

        if let Some(value) = parse_env::<u64>(ENV_MEMBER_TIMEOUT_MS)? {
            self.query.member_timeout_ms = value;
        }

        if let Some(value) = parse_env::<u64>(ENV_GLOBAL_TIMEOUT_MS)? {
            self.query.global_timeout_ms = value;
        }

        if let Some(value) = parse_env::<usize>(ENV_MAX_FAN_OUT)? {
            self.query.max_fan_out = value;
        }

        if let Some(value) = parse_env::<usize>(ENV_INBOUND_WORKERS)? {
            self.exchange.inbound_workers = value;
        }

        if let Some(value) = parse_env::<u32>(ENV_RETRY_MAX_ATTEMPTS)? {
            self.retry.max_attempts = value;
        }

        Ok(())
    }

    /// Metadata collection id to use, generating one if none is configured
    pub fn metadata_collection_id(&self) -> MetadataCollectionId {
        if self.general.metadata_collection_id.is_empty() {
            MetadataCollectionId::generate()
        } else {
            MetadataCollectionId::new(self.general.metadata_collection_id.clone())
        }
    }

    /// Get the base directory path (~/.cohort/)
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined
    pub fn base_dir() -> Result<PathBuf> {
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            let path = PathBuf::from(config_path);
            if let Some(parent) = path.parent() {
                return Ok(parent.to_path_buf());
            }
        }

        let home = home_dir()
            .ok_or_else(|| CohortError::config("Could not determine home directory"))?;

        Ok(home.join(".cohort"))
    }

    /// Get the configuration file path (~/.cohort/config.toml)
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
            return Ok(PathBuf::from(config_path));
        }

        Ok(Self::base_dir()?.join("config.toml"))
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw.parse::<T>().map_err(|e| {
                CohortError::config(format!("Invalid value for {} in environment: {}", name, e))
            })?;
            debug!("Overriding {} from environment: {}", name, raw);
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}
