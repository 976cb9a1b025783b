// crates/telemetry-cli/src/main_tests.rs
// ============================================================================
// Module: CLI Main Helpers Tests
// Description: Unit tests for argument parsing and CLI helpers.
// Purpose: Ensure bounded reads and worker overrides fail closed.
// Dependencies: telemetry-cli main helpers
// ============================================================================

//! ## Overview
//! Validates `read_bytes_with_limit`, worker resolution, log filter
//! selection, and command parsing.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;

use clap::Parser;
use telemetry_config::DrainConfig;
use tempfile::NamedTempFile;

use super::Cli;
use super::Commands;
use super::ConfigCommand;
use super::DEFAULT_STALE_AFTER_SECS;
use super::ReadLimitError;
use super::log_filter;
use super::read_bytes_with_limit;
use super::resolve_workers;

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn read_bytes_with_limit_accepts_exact_limit() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"abcd").unwrap();
    assert_eq!(read_bytes_with_limit(file.path(), 4).unwrap(), b"abcd");
}

#[test]
fn read_bytes_with_limit_rejects_oversized_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"abcde").unwrap();
    match read_bytes_with_limit(file.path(), 4) {
        Err(ReadLimitError::TooLarge {
            size,
            limit,
        }) => {
            assert_eq!(size, 5);
            assert_eq!(limit, 4);
        }
        other => panic!("expected TooLarge, got {other:?}"),
    }
}

#[test]
fn read_bytes_with_limit_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = read_bytes_with_limit(&dir.path().join("missing.json"), 4);
    assert!(matches!(result, Err(ReadLimitError::Io(_))));
}

#[test]
fn workers_override_is_validated() {
    let configured = DrainConfig {
        workers: 3,
    };
    assert_eq!(resolve_workers(configured, None).unwrap(), 3);
    assert_eq!(resolve_workers(configured, Some(8)).unwrap(), 8);
    assert!(resolve_workers(configured, Some(0)).is_err());
    assert!(resolve_workers(configured, Some(65)).is_err());
}

#[test]
fn rust_log_overrides_configured_level() {
    let filter = log_filter(Some("telemetry_store=trace"), "info").unwrap();
    assert!(filter.to_string().contains("telemetry_store=trace"));
    let fallback = log_filter(Some("  "), "warn").unwrap();
    assert_eq!(fallback.to_string(), "warn");
    assert!(log_filter(None, "telemetry=verbose").is_err());
}

#[test]
fn commands_parse() {
    let cli = Cli::try_parse_from([
        "telemetry-ingest",
        "--config",
        "ingest.toml",
        "stage",
        "--client-id",
        "c1",
        "--report-id",
        "r1",
        "--file",
        "report.json",
    ])
    .unwrap();
    assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("ingest.toml")));
    match cli.command {
        Commands::Stage(command) => {
            assert_eq!(command.client_id, "c1");
            assert_eq!(command.report_id, "r1");
        }
        other => panic!("unexpected command {other:?}"),
    }

    let status = Cli::try_parse_from(["telemetry-ingest", "status"]).unwrap();
    match status.command {
        Commands::Status(command) => {
            assert_eq!(command.stale_after_secs, DEFAULT_STALE_AFTER_SECS);
        }
        other => panic!("unexpected command {other:?}"),
    }

    let validate =
        Cli::try_parse_from(["telemetry-ingest", "config", "validate", "--config", "x.toml"])
            .unwrap();
    assert!(matches!(validate.command, Commands::Config {
        command: ConfigCommand::Validate
    }));
    assert!(Cli::try_parse_from(["telemetry-ingest", "stage", "--client-id", "c1"]).is_err());
}
