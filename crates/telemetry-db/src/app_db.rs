// crates/telemetry-db/src/app_db.rs
// ============================================================================
// Module: Logical Database
// Description: Named database owning its backend, tables, and migrations.
// Purpose: Single entry point for converging, migrating, and using a schema.
// Dependencies: crate::backend, crate::convergence, crate::migration, tracing
// ============================================================================

//! ## Overview
//! An [`AppDb`] is created once per logical database (for example
//! "Operational" or "Telemetry") and shared behind an [`Arc`] for the life of
//! the process. It exclusively owns its [`ConnectionManager`]. The version
//! table is always declared first, ahead of the caller's tables, which are
//! converged in declaration order so foreign keys resolve.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use tracing::info;

use crate::backend::ConnectionManager;
use crate::backend::DatabaseConfig;
use crate::convergence::create_table_from_spec;
use crate::dialect::Dialect;
use crate::error::DbError;
use crate::executor::Session;
use crate::executor::Transaction;
use crate::migration::DbVersion;
use crate::migration::MigrationOutcome;
use crate::migration::MigrationSet;
use crate::migration::db_version_spec;
use crate::migration::perform_db_migration;
use crate::table::TableSpec;

// ============================================================================
// SECTION: Logical Database
// ============================================================================

/// A named logical database.
///
/// # Invariants
/// - `tables` starts with the version table and holds unique table names.
pub struct AppDb {
    /// Logical name.
    name: String,
    /// Backend connection manager.
    manager: ConnectionManager,
    /// Declared tables, in creation order.
    tables: Vec<&'static TableSpec>,
    /// Migration list.
    migrations: MigrationSet,
}

impl AppDb {
    /// Declares a logical database. No I/O happens until
    /// [`AppDb::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] for invalid backend configuration and
    /// [`DbError::Validation`] when two tables share a name.
    pub fn new(
        name: &str,
        config: &DatabaseConfig,
        tables: &[&'static TableSpec],
        migrations: MigrationSet,
    ) -> Result<Arc<Self>, DbError> {
        let manager = ConnectionManager::new(name, config)?;
        let version_spec = db_version_spec()?;
        let mut declared = vec![version_spec];
        for spec in tables {
            if std::ptr::eq(*spec, version_spec) {
                continue;
            }
            if declared.iter().any(|existing| existing.name() == spec.name()) {
                return Err(DbError::Validation(format!(
                    "database {name} declares table {} twice",
                    spec.name()
                )));
            }
            declared.push(*spec);
        }
        Ok(Arc::new(Self {
            name: name.to_string(),
            manager,
            tables: declared,
            migrations,
        }))
    }

    /// Returns the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the connection manager.
    #[must_use]
    pub const fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Returns the backend dialect.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.manager.dialect()
    }

    /// Returns the declared tables, version table first.
    #[must_use]
    pub fn tables(&self) -> &[&'static TableSpec] {
        &self.tables
    }

    /// Returns the migration list.
    #[must_use]
    pub const fn migrations(&self) -> &MigrationSet {
        &self.migrations
    }

    /// Connects and verifies the backend answers.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connect`] when the backend is unreachable.
    pub fn connect(&self) -> Result<(), DbError> {
        self.manager.connect()?;
        self.manager.ping()
    }

    /// Converges every declared table, then migrates to the target version.
    ///
    /// # Errors
    ///
    /// Propagates convergence and migration failures.
    pub fn initialize(self: &Arc<Self>) -> Result<MigrationOutcome, DbError> {
        for spec in &self.tables {
            create_table_from_spec(&self.manager, spec)?;
        }
        let outcome = perform_db_migration(self)?;
        info!(
            database = %self.name,
            tables = self.tables.len(),
            version = outcome.version(),
            "database initialized"
        );
        Ok(outcome)
    }

    /// Returns the most recent version record, if any.
    ///
    /// # Errors
    ///
    /// Propagates query failures.
    pub fn current_version(self: &Arc<Self>) -> Result<Option<DbVersion>, DbError> {
        DbVersion::latest(self, &mut self.session()?)
    }

    /// Leases a connection.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::session`].
    pub fn session(&self) -> Result<Session<'_>, DbError> {
        self.manager.session()
    }

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::begin`].
    pub fn begin(&self) -> Result<Transaction<'_>, DbError> {
        self.manager.begin()
    }

    /// Closes the backend.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::close`].
    pub fn close(&self) -> Result<(), DbError> {
        self.manager.close()
    }
}

impl std::fmt::Debug for AppDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppDb")
            .field("name", &self.name)
            .field("driver", &self.manager.driver())
            .field("tables", &self.tables.iter().map(|spec| spec.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
