// crates/telemetry-db/src/backend/sqlite.rs
// ============================================================================
// Module: SQLite Backend
// Description: Single mutex-guarded SQLite connection.
// Purpose: File-backed storage for single-node deployments and tests.
// Dependencies: rusqlite
// ============================================================================

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::Connection;
use rusqlite::OpenFlags;

use super::Backend;
use super::DatabaseConfig;
use super::SessionHold;
use crate::error::DbError;
use crate::executor::Session;

/// Maximum length of a single path component.
const MAX_PATH_COMPONENT_LENGTH: usize = 255;

/// `SQLite` file backend.
///
/// # Invariants
/// - Connection access is serialized through the mutex.
/// - `None` means not yet connected or closed.
pub(super) struct SqliteBackend {
    /// Database file path.
    path: PathBuf,
    /// Busy timeout applied to the connection.
    busy_timeout: Duration,
    /// The connection, once opened.
    connection: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    /// Prepares a backend for the configured file.
    pub(super) fn new(config: &DatabaseConfig) -> Self {
        Self {
            path: PathBuf::from(&config.source),
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
            connection: Mutex::new(None),
        }
    }

    /// Locks the connection slot.
    fn slot(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>, DbError> {
        self.connection
            .lock()
            .map_err(|_| DbError::Exec("sqlite connection mutex poisoned".to_string()))
    }
}

impl Backend for SqliteBackend {
    fn connect(&self) -> Result<(), DbError> {
        let mut slot = self.slot()?;
        if slot.is_some() {
            return Ok(());
        }
        validate_path(&self.path)?;
        ensure_parent_dir(&self.path)?;
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let connection = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| DbError::Connect(err.to_string()))?;
        apply_pragmas(&connection, self.busy_timeout)?;
        *slot = Some(connection);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot().is_ok_and(|slot| slot.is_some())
    }

    fn close(&self) -> Result<(), DbError> {
        let Some(connection) = self.slot()?.take() else {
            return Ok(());
        };
        connection.close().map_err(|(_, err)| DbError::Exec(err.to_string()))
    }

    fn session(&self) -> Result<Session<'_>, DbError> {
        let hold = SessionHold::acquire(self, "sqlite")?;
        let slot = self.slot()?;
        if slot.is_none() {
            return Err(DbError::Closed(format!(
                "sqlite database {} is not open",
                self.path.display()
            )));
        }
        Ok(Session::sqlite(slot, hold))
    }
}

/// Validates the database path before opening it.
fn validate_path(path: &Path) -> Result<(), DbError> {
    for component in path.components() {
        if component.as_os_str().len() > MAX_PATH_COMPONENT_LENGTH {
            return Err(DbError::Config("sqlite path contains an overlong component".to_string()));
        }
    }
    if path.is_dir() {
        return Err(DbError::Config("sqlite path must be a file, not a directory".to_string()));
    }
    Ok(())
}

/// Ensures the parent directory of the database file exists.
fn ensure_parent_dir(path: &Path) -> Result<(), DbError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|err| DbError::Connect(err.to_string()))
        }
        _ => Ok(()),
    }
}

/// Applies pragmas required for durability and concurrent access.
fn apply_pragmas(connection: &Connection, busy_timeout: Duration) -> Result<(), DbError> {
    connection
        .execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|err| DbError::Connect(err.to_string()))?;
    connection
        .execute_batch("PRAGMA journal_mode = wal;")
        .map_err(|err| DbError::Connect(err.to_string()))?;
    connection.busy_timeout(busy_timeout).map_err(|err| DbError::Connect(err.to_string()))?;
    Ok(())
}
