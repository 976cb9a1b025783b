// crates/telemetry-store/tests/postgres_live.rs
// ============================================================================
// Module: Postgres Live Tests
// Description: Convergence, migration, and claims against a real server.
// Purpose: Exercise both Postgres drivers end to end.
// Dependencies: store test helpers
// ============================================================================

//! ## Overview
//! Runs with `--features postgres-tests`. Every test repeats its checks for
//! the plain and the pooled driver, each on freshly created databases.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

mod helpers;

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;

use helpers::infra::PostgresFixture;
use helpers::infra::TestDatabase;
use serde_json::json;
use telemetry_db::AppDb;
use telemetry_db::ConnectionManager;
use telemetry_db::DatabaseConfig;
use telemetry_db::DbError;
use telemetry_db::Driver;
use telemetry_db::Executor;
use telemetry_db::LockRequest;
use telemetry_db::MigrationOutcome;
use telemetry_db::create_table_from_spec;
use telemetry_db::migration::db_version_spec;
use telemetry_db::table_exists;
use telemetry_store::StageOutcome;
use telemetry_store::StagingQueue;
use telemetry_store::TelemetryProcessorRegistry;
use telemetry_store::operational_db;
use telemetry_store::telemetry_db;

/// Result type for live tests.
type TestResult = Result<(), Box<dyn Error>>;

/// Drivers every test runs against.
const DRIVERS: [Driver; 2] = [Driver::Postgres, Driver::PooledPostgres];

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Connects and initializes both logical databases on fresh databases.
fn open_queue(
    fixture: &PostgresFixture,
    driver: Driver,
) -> Result<(StagingQueue, [TestDatabase; 2]), Box<dyn Error>> {
    let operational_store = fixture.fresh_database()?;
    let telemetry_store = fixture.fresh_database()?;
    let operational = operational_db(&DatabaseConfig::postgres(driver, &operational_store.url))?;
    let telemetry = telemetry_db(&DatabaseConfig::postgres(driver, &telemetry_store.url))?;
    for db in [&operational, &telemetry] {
        db.connect()?;
        db.initialize()?;
    }
    let registry = Arc::new(TelemetryProcessorRegistry::standard());
    Ok((StagingQueue::new(operational, telemetry, registry), [operational_store, telemetry_store]))
}

/// Connects a bare manager to `database`.
fn connected_manager(
    name: &str,
    driver: Driver,
    database: &TestDatabase,
) -> Result<ConnectionManager, DbError> {
    let manager = ConnectionManager::new(name, &DatabaseConfig::postgres(driver, &database.url))?;
    manager.connect()?;
    Ok(manager)
}

/// Renders a one-item report.
fn report_json(report_id: &str) -> String {
    json!({
        "header": {
            "reportId": report_id,
            "reportTimeStamp": "2024-05-01T10:00:00Z",
            "reportClientId": "c1",
        },
        "telemetry": [{
            "header": {
                "telemetryId": "t1",
                "telemetryType": "cpu",
                "telemetryTimeStamp": "2024-05-01T09:59:00Z",
            },
            "telemetryData": {"load": 0.4},
        }],
    })
    .to_string()
}

/// Counts rows of `table`.
fn count_rows(db: &AppDb, table: &str) -> Result<i64, DbError> {
    let sql = format!("SELECT COUNT(*) AS \"count\" FROM \"{table}\"");
    let mut session = db.session()?;
    session
        .query_opt(&sql, &[])?
        .ok_or_else(|| DbError::Decode("count returned no row".to_string()))?
        .get_i64("count")
}

// ============================================================================
// SECTION: Engine
// ============================================================================

#[test]
fn table_creation_converges_when_repeated() -> TestResult {
    let postgres = PostgresFixture::start()?;
    for driver in DRIVERS {
        let database = postgres.fresh_database()?;
        let manager = connected_manager("Operational", driver, &database)?;
        let spec = db_version_spec()?;
        create_table_from_spec(&manager, spec)?;
        create_table_from_spec(&manager, spec)?;
        let mut session = manager.session()?;
        if !table_exists(&mut session, spec.name())? {
            return Err(format!("{driver}: dbVersion missing after convergence").into());
        }
        drop(session);
        manager.close()?;
    }
    Ok(())
}

#[test]
fn session_locks_round_trip() -> TestResult {
    let postgres = PostgresFixture::start()?;
    for driver in DRIVERS {
        let database = postgres.fresh_database()?;
        let manager = connected_manager("Telemetry", driver, &database)?;
        let request = LockRequest::session(42);
        let mut session = manager.session()?;
        manager.lock(&mut session, request)?;
        manager.unlock(&mut session, request)?;
        if !manager.try_lock(&mut session, request)? {
            return Err(format!("{driver}: released lock was not granted again").into());
        }
        manager.unlock(&mut session, request)?;
        match manager.unlock(&mut session, request) {
            Err(DbError::Lock(_)) => {}
            other => return Err(format!("{driver}: unlock of free lock gave {other:?}").into()),
        }
        let mut tx = session.begin()?;
        manager.lock(&mut tx, LockRequest::transaction(43))?;
        tx.commit()?;
    }
    Ok(())
}

#[test]
fn server_errors_carry_sqlstate() -> TestResult {
    let postgres = PostgresFixture::start()?;
    for driver in DRIVERS {
        let database = postgres.fresh_database()?;
        let manager = connected_manager("Telemetry", driver, &database)?;
        let mut session = manager.session()?;
        match session.execute("DELETE FROM \"missing\"", &[]) {
            Err(DbError::Exec(message)) if message.contains("SQLSTATE 42P01") => {}
            other => return Err(format!("{driver}: unexpected result {other:?}").into()),
        }
    }
    Ok(())
}

// ============================================================================
// SECTION: Migrations
// ============================================================================

#[test]
fn fresh_databases_bootstrap_to_latest_version() -> TestResult {
    let postgres = PostgresFixture::start()?;
    for driver in DRIVERS {
        let database = postgres.fresh_database()?;
        let operational = operational_db(&DatabaseConfig::postgres(driver, &database.url))?;
        operational.connect()?;
        let first = operational.initialize()?;
        if first != (MigrationOutcome::Bootstrapped {
            version: "1.1.0".to_string(),
        }) {
            return Err(format!("{driver}: unexpected bootstrap {first:?}").into());
        }
        let second = operational.initialize()?;
        if second != (MigrationOutcome::UpToDate {
            version: "1.1.0".to_string(),
        }) {
            return Err(format!("{driver}: unexpected rerun {second:?}").into());
        }
        operational.close()?;
    }
    Ok(())
}

// ============================================================================
// SECTION: Staging
// ============================================================================

#[test]
fn claim_next_claims_each_report_once() -> TestResult {
    let postgres = PostgresFixture::start()?;
    for driver in DRIVERS {
        let (queue, _databases) = open_queue(&postgres, driver)?;
        let outcome = queue.stage("c1", "r1", &report_json("r1"))?;
        if !matches!(outcome, StageOutcome::Staged { .. }) {
            return Err(format!("{driver}: unexpected stage {outcome:?}").into());
        }
        if !matches!(queue.stage("c1", "r1", "{}")?, StageOutcome::Duplicate { .. }) {
            return Err(format!("{driver}: duplicate stage accepted").into());
        }

        let report = queue.claim_next()?.ok_or("nothing to claim")?;
        if !report.allocated || report.allocated_at.is_none() {
            return Err(format!("{driver}: claim not recorded").into());
        }
        if queue.claim_next()?.is_some() {
            return Err(format!("{driver}: report claimed twice").into());
        }

        let stored = queue.process(&report)?;
        if stored != 1 {
            return Err(format!("{driver}: stored {stored} items").into());
        }
        if queue.depth()? != 0 || count_rows(queue.operational(), "reports")? != 0 {
            return Err(format!("{driver}: processed report left behind").into());
        }
        if count_rows(queue.telemetry(), "telemetryData")? != 1 {
            return Err(format!("{driver}: telemetry row missing").into());
        }
    }
    Ok(())
}

#[test]
fn concurrent_claimers_never_share_a_report() -> TestResult {
    let postgres = PostgresFixture::start()?;
    for driver in DRIVERS {
        let (queue, _databases) = open_queue(&postgres, driver)?;
        let mut expected = HashSet::new();
        for index in 0 .. 12 {
            let report_id = format!("r{index}");
            match queue.stage("c1", &report_id, &report_json(&report_id))? {
                StageOutcome::Staged {
                    id,
                } => expected.insert(id),
                StageOutcome::Duplicate {
                    ..
                } => return Err(format!("{driver}: unexpected duplicate").into()),
            };
        }

        let claimed: Vec<i64> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0 .. 2)
                .map(|_| {
                    let queue = queue.clone();
                    scope.spawn(move || {
                        let mut ids = Vec::new();
                        while let Some(report) = queue.claim_next().unwrap() {
                            ids.push(report.id.unwrap());
                        }
                        ids
                    })
                })
                .collect();
            workers.into_iter().flat_map(|worker| worker.join().unwrap()).collect()
        });

        let unique: HashSet<i64> = claimed.iter().copied().collect();
        if unique.len() != claimed.len() {
            return Err(format!("{driver}: a report was claimed twice").into());
        }
        if unique != expected {
            return Err(format!("{driver}: claimed {unique:?}, staged {expected:?}").into());
        }
    }
    Ok(())
}
