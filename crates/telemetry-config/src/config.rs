// crates/telemetry-config/src/config.rs
// ============================================================================
// Module: Ingest Configuration
// Description: TOML model, loading guards, and validation.
// Purpose: Fail closed on malformed configuration before connecting.
// Dependencies: serde, telemetry-db, thiserror, toml
// ============================================================================

//! ## Overview
//! A configuration file looks like:
//!
//! ```toml
//! [databases.operational]
//! driver = "sqlite3"
//! source = "/var/lib/telemetry/operational.db"
//!
//! [databases.telemetry]
//! driver = "postgres-pool"
//! source = "postgresql://ingest@db/telemetry"
//!
//! [logging]
//! level = "info"
//! format = "compact"
//!
//! [drain]
//! workers = 4
//! ```
//!
//! `[logging]` and `[drain]` are optional. The path is taken from the
//! caller, then [`CONFIG_ENV_VAR`], then [`DEFAULT_CONFIG_NAME`] in the
//! working directory.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use telemetry_db::DatabaseConfig;
use thiserror::Error;

// ============================================================================
// SECTION: Limits
// ============================================================================

/// Environment variable naming the configuration file.
pub const CONFIG_ENV_VAR: &str = "TELEMETRY_INGEST_CONFIG";
/// Configuration file used when no path is given.
pub const DEFAULT_CONFIG_NAME: &str = "telemetry-ingest.toml";
/// Maximum configuration file size in bytes.
pub const MAX_CONFIG_FILE_BYTES: usize = 1024 * 1024;
/// Maximum number of drain workers.
pub const MAX_DRAIN_WORKERS: usize = 64;
/// Maximum configuration path length in bytes.
const MAX_PATH_LENGTH: usize = 4096;
/// Maximum length of one path component in bytes.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;
/// Maximum log filter length in bytes.
const MAX_LOG_FILTER_LENGTH: usize = 512;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The file could not be located or read.
    #[error("config io error: {0}")]
    Io(String),
    /// The file is not valid TOML for the model.
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Model
// ============================================================================

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IngestConfig {
    /// Logical database backends.
    pub databases: DatabasesConfig,
    /// Log filter and format.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Drain worker settings.
    #[serde(default)]
    pub drain: DrainConfig,
}

/// Backends of the two logical databases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabasesConfig {
    /// Clients and the staging queue.
    pub operational: DatabaseConfig,
    /// Customers, tag sets, and telemetry.
    pub telemetry: DatabaseConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-field default format.
    #[default]
    Full,
    /// Single-line compact format.
    Compact,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Drain settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrainConfig {
    /// Concurrent drain workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

/// Default log filter.
fn default_log_level() -> String {
    "info".to_string()
}

/// Default drain worker count.
const fn default_workers() -> usize {
    1
}

// ============================================================================
// SECTION: Loading
// ============================================================================

impl IngestConfig {
    /// Loads and validates the configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the path is unusable, the file is too
    /// large or not UTF-8, or its content is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = resolve_path(path);
        check_path(&path)?;
        let bytes = read_limited(&path)?;
        let text = String::from_utf8(bytes)
            .map_err(|_| ConfigError::Invalid("config file must be utf-8".to_string()))?;
        Self::from_toml_str(&text)
    }

    /// Parses and validates configuration text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.databases.validate()?;
        self.logging.validate()?;
        self.drain.validate()
    }
}

impl DatabasesConfig {
    /// Validates both backends and keeps them apart.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an invalid backend or a shared
    /// data source.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, database) in [("operational", &self.operational), ("telemetry", &self.telemetry)]
        {
            database
                .validate()
                .map_err(|err| ConfigError::Invalid(format!("databases.{name}: {err}")))?;
        }
        if self.operational.source == self.telemetry.source
            && self.operational.driver.dialect() == self.telemetry.driver.dialect()
        {
            return Err(ConfigError::Invalid(
                "databases.operational and databases.telemetry must use different sources"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl LoggingConfig {
    /// Validates the log filter text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an empty or oversized filter.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.level.trim().is_empty() {
            return Err(ConfigError::Invalid("logging.level must be non-empty".to_string()));
        }
        if self.level.len() > MAX_LOG_FILTER_LENGTH {
            return Err(ConfigError::Invalid("logging.level too long".to_string()));
        }
        if self.level.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "logging.level must not contain whitespace".to_string(),
            ));
        }
        Ok(())
    }
}

impl DrainConfig {
    /// Validates the worker count.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] outside `1..=MAX_DRAIN_WORKERS`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 || self.workers > MAX_DRAIN_WORKERS {
            return Err(ConfigError::Invalid(format!(
                "drain.workers must be between 1 and {MAX_DRAIN_WORKERS}"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Picks the explicit path, then the environment, then the default name.
fn resolve_path(path: Option<&Path>) -> PathBuf {
    if let Some(path) = path {
        return path.to_path_buf();
    }
    std::env::var_os(CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_NAME), PathBuf::from)
}

/// Rejects unreasonable paths before touching the filesystem.
fn check_path(path: &Path) -> Result<(), ConfigError> {
    if path.as_os_str().len() > MAX_PATH_LENGTH {
        return Err(ConfigError::Invalid("config path exceeds max length".to_string()));
    }
    if path.components().any(|component| component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH)
    {
        return Err(ConfigError::Invalid("config path component too long".to_string()));
    }
    Ok(())
}

/// Reads at most [`MAX_CONFIG_FILE_BYTES`] from `path`.
fn read_limited(path: &Path) -> Result<Vec<u8>, ConfigError> {
    let file = File::open(path)
        .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
    let limit = u64::try_from(MAX_CONFIG_FILE_BYTES).unwrap_or(u64::MAX);
    let mut bytes = Vec::new();
    file.take(limit.saturating_add(1))
        .read_to_end(&mut bytes)
        .map_err(|err| ConfigError::Io(format!("{}: {err}", path.display())))?;
    if bytes.len() > MAX_CONFIG_FILE_BYTES {
        return Err(ConfigError::Invalid("config file exceeds size limit".to_string()));
    }
    Ok(bytes)
}

