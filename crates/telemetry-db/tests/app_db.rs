// crates/telemetry-db/tests/app_db.rs
// ============================================================================
// Module: Logical Database Tests
// Description: Convergence, migration, and row persistence on SQLite.
// Purpose: Exercise the engine end to end against real database files.
// ============================================================================

//! ## Overview
//! Integration tests over throwaway `SQLite` files:
//! - schema convergence idempotence and failure propagation
//! - fresh-database bootstrap and resumable migrations
//! - row exists/insert/update/delete through sessions and transactions

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;

use telemetry_db::AppDb;
use telemetry_db::Column;
use telemetry_db::DatabaseConfig;
use telemetry_db::DbError;
use telemetry_db::Executor;
use telemetry_db::Migration;
use telemetry_db::MigrationOutcome;
use telemetry_db::MigrationSet;
use telemetry_db::Row;
use telemetry_db::RowState;
use telemetry_db::SqlRow;
use telemetry_db::SqlType;
use telemetry_db::SqlValue;
use telemetry_db::TableSpec;
use telemetry_db::create_table_from_spec;
use telemetry_db::table_exists;
use telemetry_db::unknown_column;
use tempfile::TempDir;
use time::OffsetDateTime;
use time::macros::datetime;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Table persisted by [`Widget`].
static WIDGETS: LazyLock<TableSpec> = LazyLock::new(|| {
    TableSpec::builder("widgets")
        .column(Column::identity("id"))
        .column(Column::new("name", SqlType::Text).unique())
        .column(Column::new("size", SqlType::Integer).default_literal("0"))
        .build()
        .expect("widgets spec")
});

/// Minimal entity over `widgets`.
#[derive(Debug)]
struct Widget {
    /// Row state.
    state: RowState,
    /// Identity.
    id: Option<i64>,
    /// Unique name.
    name: String,
    /// Size.
    size: i64,
}

impl Widget {
    /// Creates an unsaved widget.
    fn new(db: &Arc<AppDb>, name: &str, size: i64) -> Self {
        Self {
            state: RowState::new(db, &WIDGETS),
            id: None,
            name: name.to_string(),
            size,
        }
    }
}

impl Row for Widget {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "name" => Ok(SqlValue::from(self.name.as_str())),
                "size" => Ok(SqlValue::from(self.size)),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.name = row.get_string("name")?;
        self.size = row.get_i64("size")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}

/// Migration bodies run so far, in order.
type Journal = Arc<Mutex<Vec<String>>>;

/// Builds a migration that records its version in `journal`.
fn journaled(version: &str, date: OffsetDateTime, journal: &Journal) -> Migration {
    let journal = Arc::clone(journal);
    let recorded = version.to_string();
    Migration::new(version, date, move |_| {
        journal.lock().expect("journal").push(recorded.clone());
        Ok(())
    })
}

/// Three-step migration history.
fn history(journal: &Journal) -> Vec<Migration> {
    vec![
        journaled("1.0.0", datetime!(2024-01-10 00:00 UTC), journal),
        journaled("1.1.0", datetime!(2024-03-02 00:00 UTC), journal),
        journaled("1.2.0", datetime!(2024-06-21 00:00 UTC), journal),
    ]
}

/// Opens a connected database over `widgets`.
fn open(dir: &TempDir, migrations: Vec<Migration>) -> Arc<AppDb> {
    let config = DatabaseConfig::sqlite(&dir.path().join("app.db"));
    let set = MigrationSet::new(migrations).expect("migrations");
    let db = AppDb::new("Operational", &config, &[&WIDGETS], set).expect("db");
    db.connect().expect("connect");
    db
}

/// Returns every recorded version, oldest first.
fn recorded_versions(db: &AppDb) -> Vec<String> {
    db.session()
        .expect("session")
        .query("SELECT \"version\" FROM \"dbVersion\" ORDER BY \"id\"", &[])
        .expect("versions")
        .iter()
        .map(|row| row.get_string("version").expect("version"))
        .collect()
}

// ============================================================================
// SECTION: Convergence
// ============================================================================

#[test]
fn convergence_is_idempotent() {
    let dir = TempDir::new().expect("tempdir");
    let db = open(&dir, vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))]);
    create_table_from_spec(db.manager(), &WIDGETS).expect("first");
    create_table_from_spec(db.manager(), &WIDGETS).expect("second");
    let mut session = db.session().expect("session");
    assert!(table_exists(&mut session, "widgets").expect("exists"));
    assert!(!table_exists(&mut session, "gadgets").expect("exists"));
    let rows = session
        .query("SELECT COUNT(*) AS \"count\" FROM sqlite_master WHERE name = 'widgets'", &[])
        .expect("catalog");
    assert_eq!(rows[0].get_i64("count").expect("count"), 1);
}

#[test]
fn convergence_failure_propagates_when_table_is_absent() {
    let dir = TempDir::new().expect("tempdir");
    let db = open(&dir, vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))]);
    let broken = TableSpec::builder("broken")
        .column(Column::identity("id"))
        .extra("CHECK (")
        .build()
        .expect("spec");
    let result = create_table_from_spec(db.manager(), &broken);
    assert!(matches!(result, Err(DbError::Exec(_))));
    assert!(!table_exists(&mut db.session().expect("session"), "broken").expect("exists"));
}

// ============================================================================
// SECTION: Migrations
// ============================================================================

#[test]
fn fresh_database_records_target_without_running_migrations() {
    let dir = TempDir::new().expect("tempdir");
    let journal = Journal::default();
    let db = open(&dir, history(&journal));
    let outcome = db.initialize().expect("initialize");
    assert_eq!(outcome, MigrationOutcome::Bootstrapped {
        version: "1.2.0".to_string(),
    });
    assert!(journal.lock().expect("journal").is_empty());
    assert_eq!(recorded_versions(&db), vec!["1.2.0"]);
    let current = db.current_version().expect("current").expect("row");
    assert_eq!(current.date, datetime!(2024-06-21 00:00 UTC));
    assert_eq!(db.initialize().expect("rerun").version(), "1.2.0");
    assert_eq!(recorded_versions(&db).len(), 1);
}

#[test]
fn migrations_resume_after_recorded_version() {
    let dir = TempDir::new().expect("tempdir");
    let journal = Journal::default();
    let first = open(&dir, history(&journal).into_iter().take(1).collect());
    first.initialize().expect("initialize");
    first.close().expect("close");

    let db = open(&dir, history(&journal));
    let outcome = db.initialize().expect("migrate");
    assert_eq!(outcome, MigrationOutcome::Migrated {
        from: "1.0.0".to_string(),
        to: "1.2.0".to_string(),
        applied: 2,
    });
    assert_eq!(*journal.lock().expect("journal"), vec!["1.1.0", "1.2.0"]);
    assert_eq!(recorded_versions(&db), vec!["1.0.0", "1.1.0", "1.2.0"]);
}

#[test]
fn failed_migration_keeps_earlier_progress() {
    let dir = TempDir::new().expect("tempdir");
    let journal = Journal::default();
    let first = open(&dir, history(&journal).into_iter().take(1).collect());
    first.initialize().expect("initialize");
    first.close().expect("close");

    let mut migrations = history(&journal);
    migrations.push(Migration::new("2.0.0", datetime!(2024-09-01 00:00 UTC), |db| {
        db.session()?.batch_execute("ALTER TABLE \"missing\" ADD COLUMN \"x\" TEXT")
    }));
    let db = open(&dir, migrations);
    let result = db.initialize();
    assert!(matches!(result, Err(DbError::Migration(_))));
    assert_eq!(db.current_version().expect("current").expect("row").version, "1.2.0");
}

#[test]
fn migrations_can_alter_schema_through_the_database() {
    let dir = TempDir::new().expect("tempdir");
    let first = open(&dir, vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))]);
    first.initialize().expect("initialize");
    first.close().expect("close");

    let db = open(&dir, vec![
        Migration::baseline("1", datetime!(2024-01-01 00:00 UTC)),
        Migration::new("2", datetime!(2024-02-01 00:00 UTC), |db| {
            db.session()?.batch_execute("ALTER TABLE \"widgets\" ADD COLUMN \"note\" TEXT")
        }),
    ]);
    db.initialize().expect("migrate");
    let rows = db
        .session()
        .expect("session")
        .query("SELECT COUNT(*) AS \"count\" FROM pragma_table_info('widgets')", &[])
        .expect("columns");
    assert_eq!(rows[0].get_i64("count").expect("count"), 4);
}

#[test]
fn unknown_recorded_version_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let first = open(&dir, vec![Migration::baseline("9.9.9", datetime!(2030-01-01 00:00 UTC))]);
    first.initialize().expect("initialize");
    first.close().expect("close");

    let journal = Journal::default();
    let db = open(&dir, history(&journal));
    assert!(matches!(db.initialize(), Err(DbError::Migration(_))));
    assert!(journal.lock().expect("journal").is_empty());
}

#[test]
fn migration_sets_reject_empty_and_duplicate_versions() {
    assert!(matches!(MigrationSet::new(Vec::new()), Err(DbError::Config(_))));
    let date = datetime!(2024-01-01 00:00 UTC);
    let duplicate = vec![Migration::baseline("1", date), Migration::baseline("1", date)];
    assert!(matches!(MigrationSet::new(duplicate), Err(DbError::Config(_))));
}

#[test]
fn duplicate_table_names_are_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let config = DatabaseConfig::sqlite(&dir.path().join("dup.db"));
    let set = MigrationSet::new(vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))])
        .expect("set");
    let copy: &'static TableSpec = Box::leak(Box::new(WIDGETS.clone()));
    let result = AppDb::new("Operational", &config, &[&WIDGETS, copy], set);
    assert!(matches!(result, Err(DbError::Validation(_))));
}

// ============================================================================
// SECTION: Rows
// ============================================================================

#[test]
fn rows_insert_lookup_update_and_delete() {
    let dir = TempDir::new().expect("tempdir");
    let db = open(&dir, vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))]);
    db.initialize().expect("initialize");

    let mut widget = Widget::new(&db, "sprocket", 3);
    assert!(!widget.exists(&mut db.session().expect("session")).expect("exists"));
    widget.insert(&mut db.session().expect("session")).expect("insert");
    let id = widget.id.expect("identity");

    let mut found = Widget::new(&db, "sprocket", 0);
    assert!(found.exists(&mut db.session().expect("session")).expect("exists"));
    assert_eq!((found.id, found.size), (Some(id), 3));

    found.size = 8;
    let mut tx = db.begin().expect("begin");
    assert_eq!(found.update(&mut tx).expect("update"), 1);
    tx.commit().expect("commit");

    let mut reread = Widget::new(&db, "sprocket", 0);
    reread.exists(&mut db.session().expect("session")).expect("exists");
    assert_eq!(reread.size, 8);

    assert_eq!(reread.delete(&mut db.session().expect("session")).expect("delete"), 1);
    assert!(!Widget::new(&db, "sprocket", 0).exists(&mut db.session().expect("s")).expect("e"));
}

#[test]
fn rows_without_identity_cannot_update_or_delete() {
    let dir = TempDir::new().expect("tempdir");
    let db = open(&dir, vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))]);
    db.initialize().expect("initialize");
    let widget = Widget::new(&db, "unsaved", 1);
    let mut session = db.session().expect("session");
    assert!(matches!(widget.update(&mut session), Err(DbError::Validation(_))));
    assert!(matches!(widget.delete(&mut session), Err(DbError::Validation(_))));
}

#[test]
fn rolled_back_inserts_are_discarded() {
    let dir = TempDir::new().expect("tempdir");
    let db = open(&dir, vec![Migration::baseline("1", datetime!(2024-01-01 00:00 UTC))]);
    db.initialize().expect("initialize");
    let mut tx = db.begin().expect("begin");
    Widget::new(&db, "ghost", 1).insert(&mut tx).expect("insert");
    tx.rollback().expect("rollback");
    assert!(!Widget::new(&db, "ghost", 0).exists(&mut db.session().expect("s")).expect("e"));
}
