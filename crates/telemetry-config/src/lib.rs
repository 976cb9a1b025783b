// crates/telemetry-config/src/lib.rs
// ============================================================================
// Module: Telemetry Config
// Description: Configuration model for the telemetry ingest service.
// Purpose: Load and validate TOML configuration before any I/O.
// Dependencies: serde, telemetry-db, thiserror, toml
// ============================================================================

//! ## Overview
//! [`IngestConfig`] is the single configuration document of the ingest
//! service. It names the backend of each logical database, the default log
//! filter, and the drain worker count. Loading is fail-closed: oversized,
//! non-UTF-8, unparsable, or out-of-range input is rejected with a
//! [`ConfigError`] and nothing is connected.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::CONFIG_ENV_VAR;
pub use config::ConfigError;
pub use config::DEFAULT_CONFIG_NAME;
pub use config::DatabasesConfig;
pub use config::DrainConfig;
pub use config::IngestConfig;
pub use config::LogFormat;
pub use config::LoggingConfig;
pub use config::MAX_CONFIG_FILE_BYTES;
pub use config::MAX_DRAIN_WORKERS;
