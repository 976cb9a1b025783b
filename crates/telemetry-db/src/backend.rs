// crates/telemetry-db/src/backend.rs
// ============================================================================
// Module: Connection Manager
// Description: Uniform lifecycle and advisory locking over SQL backends.
// Purpose: Hide SQLite, plain Postgres, and pooled Postgres behind one API.
// Dependencies: postgres, r2d2, rusqlite, serde, tracing
// ============================================================================

//! ## Overview
//! A [`ConnectionManager`] owns exactly one physical backend, chosen by the
//! configured [`Driver`]. Construction validates configuration without I/O;
//! [`ConnectionManager::connect`] opens the connection (or pool) and
//! [`ConnectionManager::close`] releases it. Statements run on a
//! [`Session`] leased from the manager.
//!
//! Advisory locks are a Postgres feature keyed by a 64-bit id, either scoped
//! to the current transaction (released by commit or rollback) or to the
//! session (released explicitly). `SQLite` has no equivalent, so lock
//! requests are accepted as no-ops there.
//!
//! Pooled Postgres is capped at `min(30, 4 x CPUs)` connections and keeps at
//! least two idle connections open.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod plain_postgres;
mod pooled_postgres;
mod sqlite;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cell::RefCell;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::info;
use tracing::warn;

use self::plain_postgres::PostgresBackend;
use self::pooled_postgres::PooledPostgresBackend;
use self::sqlite::SqliteBackend;
use crate::dialect::Dialect;
use crate::dialect::Driver;
use crate::dialect::Placeholders;
use crate::error::DbError;
use crate::executor::Executor;
use crate::executor::Session;
use crate::executor::Transaction;
use crate::value::SqlValue;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Advisory lock id serializing table creation across processes.
pub const CREATE_TABLE_LOCK_ID: i64 = 0x7465_6c65_6d01;
/// Upper bound on pooled Postgres connections regardless of CPU count.
pub const MAX_POOL_CONNECTIONS: u32 = 30;
/// Pooled connections allowed per CPU.
pub const POOL_CONNECTIONS_PER_CPU: u32 = 4;
/// Minimum idle pooled connections.
pub const MIN_POOL_CONNECTIONS: u32 = 2;
/// Default connect timeout (ms).
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default `SQLite` busy timeout (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Maximum data source length.
const MAX_SOURCE_LENGTH: usize = 4096;

// ============================================================================
// SECTION: Session Holds
// ============================================================================

thread_local! {
    /// Addresses of single-connection backends leased by the current thread.
    static HELD_BACKENDS: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a single-connection backend as leased by the current thread.
///
/// A second lease from the same thread would wait on a mutex the thread
/// already owns, so it is refused with [`DbError::Usage`] instead.
pub(crate) struct SessionHold {
    /// Address of the held backend.
    key: usize,
}

impl SessionHold {
    /// Records that the current thread is about to lease `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Usage`] when the thread already holds a session on
    /// `backend`.
    pub(crate) fn acquire<T>(backend: &T, kind: &str) -> Result<Self, DbError> {
        let key = std::ptr::from_ref(backend).addr();
        HELD_BACKENDS.with_borrow_mut(|held| {
            if held.contains(&key) {
                return Err(DbError::Usage(format!(
                    "{kind} session requested while this thread already holds one"
                )));
            }
            held.push(key);
            Ok(Self {
                key,
            })
        })
    }
}

impl Drop for SessionHold {
    fn drop(&mut self) {
        let key = self.key;
        // Thread-local storage may already be torn down at thread exit.
        let _ = HELD_BACKENDS.try_with(|held| held.borrow_mut().retain(|entry| *entry != key));
    }
}

// ============================================================================
// SECTION: Config
// ============================================================================

/// Configuration for one logical database.
///
/// # Invariants
/// - `source` is a file path for `sqlite3` and a connection URI otherwise.
/// - Timeouts are interpreted as milliseconds and must be non-zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Backend driver.
    pub driver: Driver,
    /// Backend-specific data source.
    pub source: String,
    /// Connect timeout for Postgres drivers and pool checkout.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Busy timeout for `SQLite`.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    /// Builds a `SQLite` configuration for a database file.
    #[must_use]
    pub fn sqlite(path: &Path) -> Self {
        Self {
            driver: Driver::Sqlite,
            source: path.display().to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    /// Builds a Postgres configuration for a connection URI.
    #[must_use]
    pub fn postgres(driver: Driver, uri: &str) -> Self {
        Self {
            driver,
            source: uri.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }

    /// Validates the configuration without touching the backend.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] when a field is out of range.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.source.trim().is_empty() {
            return Err(DbError::Config("data source must not be empty".to_string()));
        }
        if self.source.len() > MAX_SOURCE_LENGTH {
            return Err(DbError::Config("data source exceeds length limit".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(DbError::Config("connect_timeout_ms must be greater than zero".to_string()));
        }
        if self.busy_timeout_ms == 0 {
            return Err(DbError::Config("busy_timeout_ms must be greater than zero".to_string()));
        }
        if self.driver == Driver::Sqlite {
            let path = PathBuf::from(&self.source);
            if path.is_dir() {
                return Err(DbError::Config(
                    "sqlite data source must be a file, not a directory".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Returns the default connect timeout.
const fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

/// Returns the default busy timeout.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Pool sizing derived from the host CPU count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum open connections.
    pub max_connections: u32,
    /// Minimum idle connections.
    pub min_idle: u32,
}

impl PoolLimits {
    /// Computes limits for `cpus` logical CPUs.
    #[must_use]
    pub fn for_cpus(cpus: usize) -> Self {
        let cpus = u32::try_from(cpus).unwrap_or(u32::MAX);
        let max_connections = cpus
            .saturating_mul(POOL_CONNECTIONS_PER_CPU)
            .clamp(MIN_POOL_CONNECTIONS, MAX_POOL_CONNECTIONS);
        Self {
            max_connections,
            min_idle: MIN_POOL_CONNECTIONS,
        }
    }

    /// Computes limits for the current host.
    #[must_use]
    pub fn for_host() -> Self {
        Self::for_cpus(std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get))
    }
}

// ============================================================================
// SECTION: Advisory Locks
// ============================================================================

/// Lifetime of an advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Released automatically at commit or rollback.
    Transaction,
    /// Held until explicitly unlocked or the session ends.
    Session,
}

/// Sharing mode of an advisory lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Excludes every other holder.
    Exclusive,
    /// Compatible with other shared holders.
    Shared,
}

/// An advisory lock to acquire or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// Application-defined lock id.
    pub id: i64,
    /// Lock lifetime.
    pub scope: LockScope,
    /// Lock sharing mode.
    pub mode: LockMode,
}

impl LockRequest {
    /// Exclusive lock scoped to the current transaction.
    #[must_use]
    pub const fn transaction(id: i64) -> Self {
        Self {
            id,
            scope: LockScope::Transaction,
            mode: LockMode::Exclusive,
        }
    }

    /// Exclusive lock scoped to the session.
    #[must_use]
    pub const fn session(id: i64) -> Self {
        Self {
            id,
            scope: LockScope::Session,
            mode: LockMode::Exclusive,
        }
    }

    /// Returns the request in shared mode.
    #[must_use]
    pub const fn shared(mut self) -> Self {
        self.mode = LockMode::Shared;
        self
    }

    /// Returns the Postgres function suffix for scope and mode.
    const fn function_parts(self) -> (&'static str, &'static str) {
        let scope = match self.scope {
            LockScope::Transaction => "_xact",
            LockScope::Session => "",
        };
        let mode = match self.mode {
            LockMode::Exclusive => "",
            LockMode::Shared => "_shared",
        };
        (scope, mode)
    }

    /// Renders the blocking acquire statement.
    #[must_use]
    pub fn lock_sql(self) -> String {
        let (scope, mode) = self.function_parts();
        format!("SELECT pg_advisory{scope}_lock{mode}($1)")
    }

    /// Renders the non-blocking acquire statement.
    #[must_use]
    pub fn try_lock_sql(self) -> String {
        let (scope, mode) = self.function_parts();
        format!("SELECT pg_try_advisory{scope}_lock{mode}($1) AS \"acquired\"")
    }

    /// Renders the release statement.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Usage`] for transaction-scoped locks, which cannot
    /// be released explicitly.
    pub fn unlock_sql(self) -> Result<String, DbError> {
        if self.scope == LockScope::Transaction {
            return Err(DbError::Usage(format!(
                "advisory lock {} is transaction scoped and cannot be unlocked",
                self.id
            )));
        }
        let (_, mode) = self.function_parts();
        Ok(format!("SELECT pg_advisory_unlock{mode}($1) AS \"released\""))
    }
}

// ============================================================================
// SECTION: Backend Trait
// ============================================================================

/// Physical backend lifecycle.
trait Backend: Send + Sync {
    /// Opens the connection or pool; idempotent.
    fn connect(&self) -> Result<(), DbError>;

    /// Returns true once connected and not closed.
    fn is_connected(&self) -> bool;

    /// Releases the connection or pool; idempotent.
    fn close(&self) -> Result<(), DbError>;

    /// Leases a connection.
    fn session(&self) -> Result<Session<'_>, DbError>;
}

// ============================================================================
// SECTION: Connection Manager
// ============================================================================

/// Owner of one physical database backend.
///
/// # Invariants
/// - Exactly one backend per manager; managers are never shared between
///   logical databases.
pub struct ConnectionManager {
    /// Logical database name used in diagnostics.
    name: String,
    /// Configured driver.
    driver: Driver,
    /// Physical backend.
    backend: Box<dyn Backend>,
}

impl ConnectionManager {
    /// Validates configuration and prepares the backend without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] when the configuration is invalid.
    pub fn new(name: &str, config: &DatabaseConfig) -> Result<Self, DbError> {
        config.validate()?;
        let backend: Box<dyn Backend> = match config.driver {
            Driver::Sqlite => Box::new(SqliteBackend::new(config)),
            Driver::Postgres => Box::new(PostgresBackend::new(config)?),
            Driver::PooledPostgres => {
                Box::new(PooledPostgresBackend::new(config, PoolLimits::for_host())?)
            }
        };
        debug!(database = name, driver = %config.driver, "connection manager initialized");
        Ok(Self {
            name: name.to_string(),
            driver: config.driver,
            backend,
        })
    }

    /// Returns the logical database name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the configured driver.
    #[must_use]
    pub const fn driver(&self) -> Driver {
        self.driver
    }

    /// Returns the SQL dialect of the backend.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.driver.dialect()
    }

    /// Returns a placeholder generator for `count` bound values.
    #[must_use]
    pub const fn placeholders(&self, count: usize) -> Placeholders {
        self.dialect().placeholders(count)
    }

    /// Returns true while connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Opens the backend connection or pool.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connect`] when the backend is unreachable.
    pub fn connect(&self) -> Result<(), DbError> {
        self.backend.connect().inspect_err(|err| {
            warn!(database = %self.name, driver = %self.driver, error = %err, "connect failed");
        })?;
        info!(database = %self.name, driver = %self.driver, "database connected");
        Ok(())
    }

    /// Verifies the backend answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connect`] when the query fails.
    pub fn ping(&self) -> Result<(), DbError> {
        let result = self
            .backend
            .session()
            .and_then(|mut session| session.query("SELECT 1", &[]).map(|_| ()));
        result.map_err(|err| {
            warn!(database = %self.name, error = %err, "ping failed");
            DbError::Connect(format!("ping of {} failed: {err}", self.name))
        })
    }

    /// Releases the backend connection or pool.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when the backend reports a close failure.
    pub fn close(&self) -> Result<(), DbError> {
        self.backend.close()?;
        info!(database = %self.name, "database closed");
        Ok(())
    }

    /// Leases a connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] before connect or after close, or
    /// [`DbError::Connect`] when no pooled connection becomes available.
    pub fn session(&self) -> Result<Session<'_>, DbError> {
        self.backend.session()
    }

    /// Leases a connection and begins a transaction on it.
    ///
    /// # Errors
    ///
    /// Propagates [`ConnectionManager::session`] and `BEGIN` failures.
    pub fn begin(&self) -> Result<Transaction<'_>, DbError> {
        self.session()?.begin()
    }

    /// Acquires an advisory lock, blocking until it is granted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Lock`] when the lock statement fails.
    pub fn lock(&self, executor: &mut dyn Executor, request: LockRequest) -> Result<(), DbError> {
        if !self.dialect().supports_advisory_locks() {
            return Ok(());
        }
        // The lock functions return `void`, which has no row decoding.
        executor.execute(&request.lock_sql(), &[SqlValue::Integer(request.id)]).map_err(|err| {
            warn!(
                database = %self.name,
                lock_id = request.id,
                error = %err,
                "advisory lock failed"
            );
            DbError::Lock(format!("advisory lock {} failed: {err}", request.id))
        })?;
        debug!(database = %self.name, lock_id = request.id, "advisory lock acquired");
        Ok(())
    }

    /// Attempts an advisory lock without blocking; returns whether it was
    /// granted. Always granted on backends without advisory locks.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Lock`] when the lock statement fails.
    pub fn try_lock(
        &self,
        executor: &mut dyn Executor,
        request: LockRequest,
    ) -> Result<bool, DbError> {
        if !self.dialect().supports_advisory_locks() {
            return Ok(true);
        }
        let row = executor
            .query_opt(&request.try_lock_sql(), &[SqlValue::Integer(request.id)])
            .map_err(|err| DbError::Lock(format!("advisory lock {} failed: {err}", request.id)))?
            .ok_or_else(|| DbError::Lock("advisory lock returned no row".to_string()))?;
        row.get_bool("acquired")
    }

    /// Releases a session-scoped advisory lock.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Usage`] for transaction-scoped requests and
    /// [`DbError::Lock`] when the lock was not held or the statement fails.
    pub fn unlock(&self, executor: &mut dyn Executor, request: LockRequest) -> Result<(), DbError> {
        let sql = request.unlock_sql()?;
        if !self.dialect().supports_advisory_locks() {
            return Ok(());
        }
        let released = executor
            .query_opt(&sql, &[SqlValue::Integer(request.id)])
            .map_err(|err| DbError::Lock(format!("advisory unlock {} failed: {err}", request.id)))?
            .map(|row| row.get_bool("released"))
            .transpose()?
            .unwrap_or(false);
        if !released {
            return Err(DbError::Lock(format!("advisory lock {} was not held", request.id)));
        }
        debug!(database = %self.name, lock_id = request.id, "advisory lock released");
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .finish_non_exhaustive()
    }
}
