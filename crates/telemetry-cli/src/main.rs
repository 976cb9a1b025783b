// crates/telemetry-cli/src/main.rs
// ============================================================================
// Module: Telemetry Ingest CLI Entry Point
// Description: Command dispatcher for the telemetry ingest service.
// Purpose: Initialize databases, stage reports, drain the queue, and report.
// Dependencies: clap, telemetry-config, telemetry-db, telemetry-store, tracing
// ============================================================================

//! ## Overview
//! `telemetry-ingest` drives the ingest pipeline from the command line:
//! - `init` converges and migrates both logical databases.
//! - `stage` stages one report payload read from a file.
//! - `drain` runs one or more competing workers until the queue is empty
//!   and exits non-zero when any report failed.
//! - `status` prints schema versions, queue depth, and stale claims.
//! - `config validate` loads and validates the configuration.
//!
//! Logs go to stderr; command results go to stdout.

// ============================================================================
// SECTION: Modules
// ============================================================================

#[cfg(test)]
mod main_tests;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use telemetry_config::DrainConfig;
use telemetry_config::IngestConfig;
use telemetry_config::LogFormat;
use telemetry_config::LoggingConfig;
use telemetry_db::AppDb;
use telemetry_db::DatabaseConfig;
use telemetry_db::DbError;
use telemetry_db::migration::DB_VERSION_TABLE;
use telemetry_db::table_exists;
use telemetry_store::DrainSummary;
use telemetry_store::MAX_REPORT_BYTES;
use telemetry_store::ReportFailure;
use telemetry_store::StageOutcome;
use telemetry_store::StagingQueue;
use telemetry_store::TelemetryProcessorRegistry;
use telemetry_store::operational_db;
use telemetry_store::telemetry_db;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default age in seconds after which a claim counts as stale.
const DEFAULT_STALE_AFTER_SECS: u64 = 3600;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "telemetry-ingest", version, about = "Telemetry report ingest service")]
struct Cli {
    /// Configuration file; defaults to `TELEMETRY_INGEST_CONFIG` or
    /// `telemetry-ingest.toml`.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Command to run.
    #[command(subcommand)]
    command: Commands,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create tables and apply pending migrations.
    Init,
    /// Stage a report payload.
    Stage(StageCommand),
    /// Process staged reports until none remain.
    Drain(DrainCommand),
    /// Show schema versions and queue state.
    Status(StatusCommand),
    /// Configuration utilities.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

/// Arguments of `stage`.
#[derive(Args, Debug)]
struct StageCommand {
    /// Submitting client.
    #[arg(long = "client-id", value_name = "ID")]
    client_id: String,
    /// Report identifier, unique per client.
    #[arg(long = "report-id", value_name = "ID")]
    report_id: String,
    /// File holding the JSON payload.
    #[arg(long, value_name = "PATH")]
    file: PathBuf,
}

/// Arguments of `drain`.
#[derive(Args, Debug)]
struct DrainCommand {
    /// Worker threads; overrides `drain.workers`.
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
}

/// Arguments of `status`.
#[derive(Args, Debug)]
struct StatusCommand {
    /// Age after which a claimed report counts as stale.
    #[arg(
        long = "stale-after-secs",
        value_name = "SECS",
        default_value_t = DEFAULT_STALE_AFTER_SECS
    )]
    stale_after_secs: u64,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load and validate the configuration.
    Validate,
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error carrying a user-facing message.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

/// Errors raised while reading a bounded input file.
#[derive(Debug)]
enum ReadLimitError {
    /// I/O failure while reading.
    Io(std::io::Error),
    /// The file exceeds the limit.
    TooLarge {
        /// Observed size in bytes.
        size: u64,
        /// Allowed limit in bytes.
        limit: usize,
    },
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Loads configuration, installs logging, and dispatches the command.
fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let config = IngestConfig::load(cli.config.as_deref())
        .map_err(|err| CliError::new(format!("failed to load config: {err}")))?;
    if let Commands::Config {
        command: ConfigCommand::Validate,
    } = cli.command
    {
        write_stdout_line("config ok")?;
        return Ok(ExitCode::SUCCESS);
    }
    init_logging(&config.logging)?;
    match cli.command {
        Commands::Init => command_init(&config),
        Commands::Stage(command) => command_stage(&config, &command),
        Commands::Drain(command) => command_drain(&config, &command),
        Commands::Status(command) => command_status(&config, &command),
        Commands::Config {
            ..
        } => Ok(ExitCode::SUCCESS),
    }
}

// ============================================================================
// SECTION: Logging
// ============================================================================

/// Builds the log filter: `RUST_LOG` when set, else the configured level.
fn log_filter(env_value: Option<&str>, level: &str) -> CliResult<EnvFilter> {
    let directives = env_value.filter(|value| !value.trim().is_empty()).unwrap_or(level);
    EnvFilter::try_new(directives)
        .map_err(|err| CliError::new(format!("invalid log filter {directives}: {err}")))
}

/// Installs the global stderr subscriber.
fn init_logging(logging: &LoggingConfig) -> CliResult<()> {
    let env_value = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = log_filter(env_value.as_deref(), &logging.level)?;
    let builder =
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let installed = match logging.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|err| CliError::new(format!("failed to install logging: {err}")))
}

// ============================================================================
// SECTION: Databases
// ============================================================================

/// Declares and connects one logical database.
fn connect_database(
    declare: fn(&DatabaseConfig) -> Result<Arc<AppDb>, DbError>,
    config: &DatabaseConfig,
) -> CliResult<Arc<AppDb>> {
    let db = declare(config).map_err(|err| CliError::new(err.to_string()))?;
    db.connect()
        .map_err(|err| CliError::new(format!("failed to connect {}: {err}", db.name())))?;
    Ok(db)
}

/// Connects both logical databases.
fn connect_all(config: &IngestConfig) -> CliResult<(Arc<AppDb>, Arc<AppDb>)> {
    let operational = connect_database(operational_db, &config.databases.operational)?;
    let telemetry = connect_database(telemetry_db, &config.databases.telemetry)?;
    Ok((operational, telemetry))
}

/// Converges and migrates a connected database.
fn initialize(db: &Arc<AppDb>) -> CliResult<String> {
    let outcome = db
        .initialize()
        .map_err(|err| CliError::new(format!("failed to initialize {}: {err}", db.name())))?;
    Ok(outcome.version().to_string())
}

/// Connects and initializes both databases, returning the staging queue.
fn open_queue(config: &IngestConfig) -> CliResult<StagingQueue> {
    let (operational, telemetry) = connect_all(config)?;
    initialize(&operational)?;
    initialize(&telemetry)?;
    Ok(StagingQueue::new(
        operational,
        telemetry,
        Arc::new(TelemetryProcessorRegistry::standard()),
    ))
}

/// Closes both databases of a queue.
fn close_queue(queue: &StagingQueue) -> CliResult<()> {
    for db in [queue.operational(), queue.telemetry()] {
        db.close()
            .map_err(|err| CliError::new(format!("failed to close {}: {err}", db.name())))?;
    }
    Ok(())
}

// ============================================================================
// SECTION: Commands
// ============================================================================

/// Executes `init`.
fn command_init(config: &IngestConfig) -> CliResult<ExitCode> {
    let (operational, telemetry) = connect_all(config)?;
    for db in [&operational, &telemetry] {
        let version = initialize(db)?;
        write_stdout_line(&format!("{}: version {version}", db.name()))?;
        db.close().map_err(|err| CliError::new(err.to_string()))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes `stage`.
fn command_stage(config: &IngestConfig, command: &StageCommand) -> CliResult<ExitCode> {
    let bytes = read_bytes_with_limit(&command.file, MAX_REPORT_BYTES).map_err(|err| match err {
        ReadLimitError::Io(err) => {
            CliError::new(format!("failed to read {}: {err}", command.file.display()))
        }
        ReadLimitError::TooLarge {
            size,
            limit,
        } => CliError::new(format!(
            "{} is {size} bytes; reports are limited to {limit} bytes",
            command.file.display()
        )),
    })?;
    let data = String::from_utf8(bytes).map_err(|_| {
        CliError::new(format!("{} must be utf-8", command.file.display()))
    })?;
    let queue = open_queue(config)?;
    let outcome = queue
        .stage(&command.client_id, &command.report_id, &data)
        .map_err(|err| CliError::new(format!("failed to stage report: {err}")))?;
    let message = match outcome {
        StageOutcome::Staged {
            id,
        } => format!("staged report {} as {id}", command.report_id),
        StageOutcome::Duplicate {
            id,
        } => format!("report {} already staged as {id}", command.report_id),
    };
    write_stdout_line(&message)?;
    close_queue(&queue)?;
    Ok(ExitCode::SUCCESS)
}

/// Executes `drain`.
fn command_drain(config: &IngestConfig, command: &DrainCommand) -> CliResult<ExitCode> {
    let workers = resolve_workers(config.drain, command.workers)?;
    let queue = open_queue(config)?;
    info!(workers, "draining staging queue");
    let (summary, failures) = drain_with_workers(&queue, workers)?;
    write_stdout_line(&format!(
        "drained: {} processed, {} failed",
        summary.processed, summary.failed
    ))?;
    for failure in &failures {
        write_stderr_line(&failure.to_string())
            .map_err(|err| CliError::new(output_error("stderr", &err)))?;
    }
    close_queue(&queue)?;
    if failures.is_empty() { Ok(ExitCode::SUCCESS) } else { Ok(ExitCode::FAILURE) }
}

/// Applies a `--workers` override and validates the result.
fn resolve_workers(configured: DrainConfig, requested: Option<usize>) -> CliResult<usize> {
    let drain = DrainConfig {
        workers: requested.unwrap_or(configured.workers),
    };
    drain.validate().map_err(|err| CliError::new(err.to_string()))?;
    Ok(drain.workers)
}

/// Runs `workers` competing drains and merges their results.
fn drain_with_workers(
    queue: &StagingQueue,
    workers: usize,
) -> CliResult<(DrainSummary, Vec<ReportFailure>)> {
    let outcomes = std::thread::scope(|scope| {
        let handles: Vec<_> = (0 .. workers).map(|_| scope.spawn(|| queue.drain())).collect();
        handles.into_iter().map(std::thread::ScopedJoinHandle::join).collect::<Result<Vec<_>, _>>()
    })
    .map_err(|_| CliError::new("drain worker panicked".to_string()))?;
    let mut summary = DrainSummary::default();
    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome {
            Ok(worker) => summary = summary.merge(worker),
            Err(err) => {
                summary = summary.merge(err.summary);
                failures.extend(err.failures);
            }
        }
    }
    Ok((summary, failures))
}

/// Executes `status`.
fn command_status(config: &IngestConfig, command: &StatusCommand) -> CliResult<ExitCode> {
    let (operational, telemetry) = connect_all(config)?;
    let mut initialized = true;
    for db in [&operational, &telemetry] {
        match schema_version(db)? {
            Some(version) => write_stdout_line(&format!("{}: version {version}", db.name()))?,
            None => {
                initialized = false;
                write_stdout_line(&format!("{}: uninitialized", db.name()))?;
            }
        }
    }
    let queue = StagingQueue::new(
        operational,
        telemetry,
        Arc::new(TelemetryProcessorRegistry::standard()),
    );
    if initialized {
        let depth = queue.depth().map_err(|err| CliError::new(err.to_string()))?;
        let stale = queue
            .stale_claims(Duration::from_secs(command.stale_after_secs))
            .map_err(|err| CliError::new(err.to_string()))?;
        write_stdout_line(&format!("queue depth: {depth}"))?;
        write_stdout_line(&format!(
            "stale claims: {} (older than {}s)",
            stale.len(),
            command.stale_after_secs
        ))?;
    }
    close_queue(&queue)?;
    Ok(ExitCode::SUCCESS)
}

/// Returns the recorded schema version, or `None` before `init`.
fn schema_version(db: &Arc<AppDb>) -> CliResult<Option<String>> {
    let exists = table_exists(
        &mut db.session().map_err(|err| CliError::new(err.to_string()))?,
        DB_VERSION_TABLE,
    )
    .map_err(|err| CliError::new(err.to_string()))?;
    if !exists {
        return Ok(None);
    }
    let current = db.current_version().map_err(|err| CliError::new(err.to_string()))?;
    Ok(current.map(|record| record.version))
}

// ============================================================================
// SECTION: I/O Helpers
// ============================================================================

/// Reads a file from disk while enforcing a hard size limit.
fn read_bytes_with_limit(path: &Path, max_bytes: usize) -> Result<Vec<u8>, ReadLimitError> {
    let file = File::open(path).map_err(ReadLimitError::Io)?;
    let size = file.metadata().map_err(ReadLimitError::Io)?.len();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX);
    if size > limit {
        return Err(ReadLimitError::TooLarge {
            size,
            limit: max_bytes,
        });
    }
    let mut bytes = Vec::new();
    file.take(limit.saturating_add(1)).read_to_end(&mut bytes).map_err(ReadLimitError::Io)?;
    if bytes.len() > max_bytes {
        return Err(ReadLimitError::TooLarge {
            size: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            limit: max_bytes,
        });
    }
    Ok(bytes)
}

/// Writes a line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}").map_err(|err| CliError::new(output_error("stdout", &err)))
}

/// Writes a line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Formats an output failure.
fn output_error(stream: &str, error: &std::io::Error) -> String {
    format!("failed to write to {stream}: {error}")
}

/// Reports a fatal error and returns the failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}
