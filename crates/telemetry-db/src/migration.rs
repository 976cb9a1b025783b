// crates/telemetry-db/src/migration.rs
// ============================================================================
// Module: Migration Engine
// Description: Version-tracked, forward-only schema and data migrations.
// Purpose: Bring a logical database to the newest schema version safely.
// Dependencies: crate::row, time, tracing
// ============================================================================

//! ## Overview
//! A [`MigrationSet`] is the ordered list of hand-authored migrations for a
//! logical database; its last entry is the target version. Progress is
//! recorded in the `dbVersion` table, one row per version reached, and the
//! row with the highest id is the current version.
//!
//! [`perform_db_migration`] handles three cases:
//! - no version row: tables were just created from the newest
//!   specifications, so the target version is recorded without running any
//!   migration;
//! - a known version: every later migration runs in order, each followed by
//!   its own version row, so a crash resumes after the last recorded step;
//! - an unknown version: fails, since no safe continuation exists.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;

use time::OffsetDateTime;
use tracing::debug;
use tracing::info;

use crate::app_db::AppDb;
use crate::error::DbError;
use crate::executor::Executor;
use crate::row::Row;
use crate::row::RowState;
use crate::row::select_rows;
use crate::row::unknown_column;
use crate::statement::SelectOptions;
use crate::table::Column;
use crate::table::SqlType;
use crate::table::TableSpec;
use crate::value::SqlRow;
use crate::value::SqlValue;

// ============================================================================
// SECTION: Migrations
// ============================================================================

/// Migration body: receives the database being migrated.
pub type MigrationFn = dyn Fn(&Arc<AppDb>) -> Result<(), DbError> + Send + Sync;

/// One forward migration.
#[derive(Clone)]
pub struct Migration {
    /// Version reached after the migration runs.
    version: String,
    /// Authoring date recorded with the version.
    date: OffsetDateTime,
    /// Migration body.
    apply: Arc<MigrationFn>,
}

impl Migration {
    /// Creates a migration to `version`.
    #[must_use]
    pub fn new<F>(version: &str, date: OffsetDateTime, apply: F) -> Self
    where
        F: Fn(&Arc<AppDb>) -> Result<(), DbError> + Send + Sync + 'static,
    {
        Self {
            version: version.to_string(),
            date,
            apply: Arc::new(apply),
        }
    }

    /// Creates a migration with no body, typically the initial version.
    #[must_use]
    pub fn baseline(version: &str, date: OffsetDateTime) -> Self {
        Self::new(version, date, |_| Ok(()))
    }

    /// Returns the target version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the authoring date.
    #[must_use]
    pub const fn date(&self) -> OffsetDateTime {
        self.date
    }

    /// Runs the migration body.
    ///
    /// # Errors
    ///
    /// Returns whatever the body returns.
    pub fn apply(&self, db: &Arc<AppDb>) -> Result<(), DbError> {
        (self.apply)(db)
    }
}

impl std::fmt::Debug for Migration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("date", &self.date)
            .finish_non_exhaustive()
    }
}

/// Ordered, non-empty list of migrations with unique versions.
///
/// # Invariants
/// - `migrations` is non-empty; the last entry is the target version.
/// - `index` maps every version to its position.
#[derive(Debug, Clone)]
pub struct MigrationSet {
    /// Migrations, oldest first.
    migrations: Vec<Migration>,
    /// Version to position.
    index: HashMap<String, usize>,
}

impl MigrationSet {
    /// Validates and indexes a migration list.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] when the list is empty or a version is
    /// blank or repeated.
    pub fn new(migrations: Vec<Migration>) -> Result<Self, DbError> {
        if migrations.is_empty() {
            return Err(DbError::Config("migration list must not be empty".to_string()));
        }
        let mut index = HashMap::with_capacity(migrations.len());
        for (position, migration) in migrations.iter().enumerate() {
            if migration.version.trim().is_empty() {
                return Err(DbError::Config("migration version must not be empty".to_string()));
            }
            if index.insert(migration.version.clone(), position).is_some() {
                return Err(DbError::Config(format!(
                    "migration version {} is declared twice",
                    migration.version
                )));
            }
        }
        Ok(Self {
            migrations,
            index,
        })
    }

    /// Returns every migration, oldest first.
    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Returns the newest migration.
    #[must_use]
    pub fn target(&self) -> &Migration {
        // Non-empty by construction.
        &self.migrations[self.migrations.len() - 1]
    }

    /// Returns the position of `version`, if known.
    #[must_use]
    pub fn index_of(&self, version: &str) -> Option<usize> {
        self.index.get(version).copied()
    }

    /// Returns the migrations after position `index`.
    #[must_use]
    pub fn pending_after(&self, index: usize) -> &[Migration] {
        self.migrations.get(index + 1 ..).unwrap_or(&[])
    }
}

// ============================================================================
// SECTION: Version Records
// ============================================================================

/// Name of the version table.
pub const DB_VERSION_TABLE: &str = "dbVersion";

/// Specification of the version table.
static DB_VERSION_SPEC: LazyLock<Result<TableSpec, DbError>> = LazyLock::new(|| {
    TableSpec::builder(DB_VERSION_TABLE)
        .column(Column::identity("id"))
        .column(Column::new("version", SqlType::Text))
        .column(Column::new("date", SqlType::Timestamp))
        .build()
});

/// Returns the version table specification.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the specification is malformed.
pub fn db_version_spec() -> Result<&'static TableSpec, DbError> {
    DB_VERSION_SPEC.as_ref().map_err(Clone::clone)
}

/// One recorded schema version.
#[derive(Debug, Clone)]
pub struct DbVersion {
    /// Row state.
    state: RowState,
    /// Backend-assigned id; increases with every recorded version.
    pub id: Option<i64>,
    /// Version identifier.
    pub version: String,
    /// Date of the migration that produced the version.
    pub date: OffsetDateTime,
}

impl DbVersion {
    /// Creates an unsaved version record.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the version table specification is
    /// malformed.
    pub fn new(db: &Arc<AppDb>, version: &str, date: OffsetDateTime) -> Result<Self, DbError> {
        Ok(Self {
            state: RowState::new(db, db_version_spec()?),
            id: None,
            version: version.to_string(),
            date,
        })
    }

    /// Reads the most recent version record, if any.
    ///
    /// # Errors
    ///
    /// Propagates query and decode failures.
    pub fn latest(db: &Arc<AppDb>, executor: &mut dyn Executor) -> Result<Option<Self>, DbError> {
        let spec = db_version_spec()?;
        let rows = select_rows(
            executor,
            spec,
            &spec.column_names(),
            &[],
            &[],
            &SelectOptions::default().order_by("id").descending().limit(1),
        )?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let mut record = Self::new(db, "", OffsetDateTime::UNIX_EPOCH)?;
        record.load(row)?;
        Ok(Some(record))
    }
}

impl Row for DbVersion {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["id"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "version" => Ok(SqlValue::from(self.version.as_str())),
                "date" => Ok(SqlValue::from(self.date)),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.version = row.get_string("version")?;
        self.date = row.get_timestamp("date")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}

// ============================================================================
// SECTION: Engine
// ============================================================================

/// Result of a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Fresh database; the target version was recorded directly.
    Bootstrapped {
        /// Recorded version.
        version: String,
    },
    /// Already at the target version.
    UpToDate {
        /// Current version.
        version: String,
    },
    /// Pending migrations were applied.
    Migrated {
        /// Version before the run.
        from: String,
        /// Version after the run.
        to: String,
        /// Number of migrations applied.
        applied: usize,
    },
}

impl MigrationOutcome {
    /// Returns the version the database is at after the run.
    #[must_use]
    pub fn version(&self) -> &str {
        match self {
            Self::Bootstrapped {
                version,
            }
            | Self::UpToDate {
                version,
            } => version,
            Self::Migrated {
                to, ..
            } => to,
        }
    }
}

/// Brings `db` to the target version of its migration set.
///
/// # Errors
///
/// Returns [`DbError::Migration`] when the recorded version is unknown or a
/// migration body fails, and propagates storage failures. Versions recorded
/// before a failure stay recorded.
pub fn perform_db_migration(db: &Arc<AppDb>) -> Result<MigrationOutcome, DbError> {
    let set = db.migrations();
    let current = DbVersion::latest(db, &mut db.session()?)?;
    let Some(current) = current else {
        let target = set.target();
        DbVersion::new(db, target.version(), target.date())?.insert(&mut db.session()?)?;
        info!(database = db.name(), version = target.version(), "schema version bootstrapped");
        return Ok(MigrationOutcome::Bootstrapped {
            version: target.version().to_string(),
        });
    };
    let index = set.index_of(&current.version).ok_or_else(|| {
        DbError::Migration(format!(
            "database {} is at unknown version {}",
            db.name(),
            current.version
        ))
    })?;
    let pending = set.pending_after(index);
    if pending.is_empty() {
        debug!(database = db.name(), version = %current.version, "schema up to date");
        return Ok(MigrationOutcome::UpToDate {
            version: current.version,
        });
    }
    for migration in pending {
        info!(database = db.name(), version = migration.version(), "applying migration");
        migration.apply(db).map_err(|err| {
            DbError::Migration(format!(
                "migration of {} to version {} failed: {err}",
                db.name(),
                migration.version()
            ))
        })?;
        DbVersion::new(db, migration.version(), migration.date())?.insert(&mut db.session()?)?;
        info!(database = db.name(), version = migration.version(), "migration recorded");
    }
    Ok(MigrationOutcome::Migrated {
        from: current.version,
        to: set.target().version().to_string(),
        applied: pending.len(),
    })
}
