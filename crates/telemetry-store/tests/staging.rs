// crates/telemetry-store/tests/staging.rs
// ============================================================================
// Module: Staging Queue Tests
// Description: Stage, claim, process, and drain against SQLite files.
// Purpose: Exercise the ingest pipeline end to end.
// ============================================================================

//! ## Overview
//! Covers claim exclusivity, drain failure isolation, idempotent
//! reprocessing, reference row resolution, and the operational schema
//! upgrade.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::Value;
use serde_json::json;
use telemetry_db::AppDb;
use telemetry_db::DatabaseConfig;
use telemetry_db::DbError;
use telemetry_db::Dialect;
use telemetry_db::Executor;
use telemetry_db::MigrationOutcome;
use telemetry_db::Row;
use telemetry_db::migration::DbVersion;
use telemetry_db::migration::db_version_spec;
use telemetry_store::DefaultProcessor;
use telemetry_store::ItemContext;
use telemetry_store::MAX_REPORT_BYTES;
use telemetry_store::StageOutcome;
use telemetry_store::StagingQueue;
use telemetry_store::StoreError;
use telemetry_store::TelemetryProcessor;
use telemetry_store::TelemetryProcessorRegistry;
use telemetry_store::UNKNOWN_CUSTOMER;
use telemetry_store::entities::client::clients_spec;
use telemetry_store::operational_db;
use telemetry_store::telemetry_db;
use tempfile::TempDir;
use time::macros::datetime;

// ============================================================================
// SECTION: Fixtures
// ============================================================================

/// Opens and initializes both databases under `dir`.
fn open_databases(dir: &TempDir) -> (Arc<AppDb>, Arc<AppDb>) {
    let operational =
        operational_db(&DatabaseConfig::sqlite(&dir.path().join("operational.db"))).unwrap();
    let telemetry =
        telemetry_db(&DatabaseConfig::sqlite(&dir.path().join("telemetry.db"))).unwrap();
    for db in [&operational, &telemetry] {
        db.connect().unwrap();
        db.initialize().unwrap();
    }
    (operational, telemetry)
}

/// Builds a queue with the standard registry.
fn open_queue(dir: &TempDir) -> StagingQueue {
    let (operational, telemetry) = open_databases(dir);
    StagingQueue::new(operational, telemetry, Arc::new(TelemetryProcessorRegistry::standard()))
}

/// Renders a report with one item per `(telemetryId, telemetryType, customerId)`.
fn report_json(report_id: &str, items: &[(&str, &str, Option<&str>)]) -> String {
    let telemetry: Vec<Value> = items
        .iter()
        .map(|(telemetry_id, telemetry_type, customer_id)| {
            let mut header = json!({
                "telemetryId": telemetry_id,
                "telemetryType": telemetry_type,
                "telemetryTimeStamp": "2024-05-01T09:59:00Z",
            });
            if let Some(customer_id) = customer_id {
                header["customerId"] = json!(customer_id);
            }
            json!({"header": header, "telemetryData": {"value": 1}})
        })
        .collect();
    json!({
        "header": {
            "reportId": report_id,
            "reportTimeStamp": "2024-05-01T10:00:00Z",
            "reportClientId": "c1",
        },
        "telemetry": telemetry,
    })
    .to_string()
}

/// Counts rows of `table`.
fn count_rows(db: &AppDb, table: &str) -> i64 {
    let sql = format!("SELECT COUNT(*) AS \"count\" FROM \"{table}\"");
    db.session().unwrap().query(&sql, &[]).unwrap()[0].get_i64("count").unwrap()
}

/// Returns the staging row id of a fresh stage.
fn staged(outcome: StageOutcome) -> i64 {
    match outcome {
        StageOutcome::Staged {
            id,
        } => id,
        StageOutcome::Duplicate {
            ..
        } => panic!("expected a fresh stage"),
    }
}

// ============================================================================
// SECTION: Staging
// ============================================================================

#[test]
fn staging_registers_client_and_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let id = staged(queue.stage("c1", "r1", "{}").unwrap());
    let again = queue.stage("c1", "r1", "{\"other\":true}").unwrap();
    assert_eq!(again, StageOutcome::Duplicate {
        id
    });
    assert_eq!(count_rows(queue.operational(), "reports"), 1);
    assert_eq!(count_rows(queue.operational(), "clients"), 1);

    let other_client = staged(queue.stage("c2", "r1", "{}").unwrap());
    assert_ne!(other_client, id);
    assert_eq!(queue.depth().unwrap(), 2);
}

#[test]
fn staging_validates_input_before_io() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    assert!(matches!(queue.stage(" ", "r1", "{}"), Err(StoreError::Validation(_))));
    assert!(matches!(queue.stage("c1", "", "{}"), Err(StoreError::Validation(_))));
    let oversized = "x".repeat(MAX_REPORT_BYTES + 1);
    assert!(matches!(queue.stage("c1", "r1", &oversized), Err(StoreError::Validation(_))));
    assert_eq!(count_rows(queue.operational(), "clients"), 0);
}

// ============================================================================
// SECTION: Claims
// ============================================================================

#[test]
fn claim_marks_report_allocated_and_hides_it() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let id = staged(queue.stage("c1", "r1", "{}").unwrap());

    let claimed = queue.claim_next().unwrap().expect("work available");
    assert_eq!(claimed.id, Some(id));
    assert_eq!(claimed.client_id, "c1");
    assert_eq!(claimed.report_id, "r1");
    assert_eq!(claimed.data, "{}");
    assert!(claimed.allocated);
    assert!(claimed.allocated_at.is_some());

    assert!(queue.claim_next().unwrap().is_none());
    assert_eq!(queue.depth().unwrap(), 0);
}

#[test]
fn claims_follow_staging_order() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let first = staged(queue.stage("c1", "r1", "{}").unwrap());
    let second = staged(queue.stage("c1", "r2", "{}").unwrap());
    assert_eq!(queue.claim_next().unwrap().unwrap().id, Some(first));
    assert_eq!(queue.claim_next().unwrap().unwrap().id, Some(second));
}

#[test]
fn concurrent_claimers_never_share_a_report() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let mut expected = HashSet::new();
    for index in 0 .. 24 {
        expected.insert(staged(queue.stage("c1", &format!("r{index}"), "{}").unwrap()));
    }

    let claimed: Vec<i64> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0 .. 4)
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
    assert_eq!(unique.len(), claimed.len(), "a report was claimed twice");
    assert_eq!(unique, expected);
}

#[test]
fn stale_claims_report_old_allocations_only() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    staged(queue.stage("c1", "r1", "{}").unwrap());
    staged(queue.stage("c1", "r2", "{}").unwrap());
    let claimed = queue.claim_next().unwrap().unwrap();

    let stale = queue.stale_claims(Duration::ZERO).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, claimed.id);
    assert!(queue.stale_claims(Duration::from_secs(3600)).unwrap().is_empty());
    assert!(queue.stale_claims(Duration::MAX).unwrap().is_empty());
}

// ============================================================================
// SECTION: Processing
// ============================================================================

#[test]
fn processing_stores_items_and_deletes_the_staged_row() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let data = report_json("r1", &[("t1", "cpu", Some("acme")), ("t2", "disk", None)]);
    staged(queue.stage("c1", "r1", &data).unwrap());

    let report = queue.claim_next().unwrap().unwrap();
    assert_eq!(queue.process(&report).unwrap(), 2);
    assert_eq!(count_rows(queue.operational(), "reports"), 0);
    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 2);

    let mut session = queue.telemetry().session().unwrap();
    let customers: Vec<String> = session
        .query("SELECT \"customerId\" FROM \"customers\" ORDER BY \"customerId\"", &[])
        .unwrap()
        .iter()
        .map(|row| row.get_string("customerId").unwrap())
        .collect();
    assert_eq!(customers, vec![UNKNOWN_CUSTOMER.to_string(), "acme".to_string()]);
    let untagged = session
        .query(
            "SELECT COUNT(*) AS \"count\" FROM \"telemetryData\" WHERE \"tagSetId\" IS NULL",
            &[],
        )
        .unwrap();
    assert_eq!(untagged[0].get_i64("count").unwrap(), 2);
}

#[test]
fn reprocessing_a_report_does_not_duplicate_telemetry() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    staged(queue.stage("c1", "r1", &report_json("r1", &[("t1", "cpu", None)])).unwrap());
    let report = queue.claim_next().unwrap().unwrap();
    queue.process(&report).unwrap();
    queue.process(&report).unwrap();
    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 1);
    assert_eq!(count_rows(queue.telemetry(), "customers"), 1);
}

#[test]
fn annotations_share_one_tag_set() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let data = json!({
        "header": {
            "reportId": "r1",
            "reportTimeStamp": "2024-05-01T10:00:00Z",
            "reportClientId": "c1",
            "reportAnnotations": {"site": "lab"},
        },
        "telemetry": [
            {
                "header": {
                    "telemetryId": "t1",
                    "telemetryType": "cpu",
                    "telemetryTimeStamp": "2024-05-01T09:59:00Z",
                },
                "telemetryData": 1,
            },
            {
                "header": {
                    "telemetryId": "t2",
                    "telemetryType": "cpu",
                    "telemetryTimeStamp": "2024-05-01T09:59:30Z",
                    "telemetryAnnotations": {"host": "a"},
                },
                "telemetryData": 2,
            },
            {
                "header": {
                    "telemetryId": "t3",
                    "telemetryType": "cpu",
                    "telemetryTimeStamp": "2024-05-01T09:59:45Z",
                },
                "telemetryData": 3,
            },
        ],
    })
    .to_string();
    staged(queue.stage("c1", "r1", &data).unwrap());
    let report = queue.claim_next().unwrap().unwrap();
    assert_eq!(queue.process(&report).unwrap(), 3);
    assert_eq!(count_rows(queue.telemetry(), "tagSets"), 2);
    let tagged = queue
        .telemetry()
        .session()
        .unwrap()
        .query(
            "SELECT COUNT(DISTINCT \"tagSetId\") AS \"count\" FROM \"telemetryData\"",
            &[],
        )
        .unwrap();
    assert_eq!(tagged[0].get_i64("count").unwrap(), 2);
}

#[test]
fn mismatched_report_id_is_a_payload_error() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    staged(queue.stage("c1", "r1", &report_json("r9", &[("t1", "cpu", None)])).unwrap());
    let report = queue.claim_next().unwrap().unwrap();
    assert!(matches!(queue.process(&report), Err(StoreError::Payload(_))));
    assert_eq!(count_rows(queue.operational(), "reports"), 1);
    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 0);
}

/// Processor counting the items it sees before storing them normally.
#[derive(Debug)]
struct CountingProcessor {
    /// Items seen.
    seen: Arc<AtomicUsize>,
}

impl TelemetryProcessor for CountingProcessor {
    fn process(
        &self,
        executor: &mut dyn Executor,
        item: &ItemContext<'_>,
    ) -> Result<(), StoreError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        DefaultProcessor.process(executor, item)
    }
}

/// Processor rejecting every item.
#[derive(Debug)]
struct RejectingProcessor;

impl TelemetryProcessor for RejectingProcessor {
    fn process(&self, _: &mut dyn Executor, _: &ItemContext<'_>) -> Result<(), StoreError> {
        Err(StoreError::Processor("rejected".to_string()))
    }
}

/// Processor that opens its own session instead of using the executor.
#[derive(Debug)]
struct SessionOpeningProcessor;

impl TelemetryProcessor for SessionOpeningProcessor {
    fn process(&self, _: &mut dyn Executor, item: &ItemContext<'_>) -> Result<(), StoreError> {
        item.db.session()?;
        Ok(())
    }
}

#[test]
fn registered_processors_handle_their_types() {
    let dir = TempDir::new().unwrap();
    let (operational, telemetry) = open_databases(&dir);
    let seen = Arc::new(AtomicUsize::new(0));
    let registry = TelemetryProcessorRegistry::builder()
        .default_processor(DefaultProcessor)
        .register("cpu", CountingProcessor {
            seen: Arc::clone(&seen),
        })
        .build()
        .unwrap();
    let queue = StagingQueue::new(operational, telemetry, Arc::new(registry));
    let data = report_json("r1", &[("t1", "cpu", None), ("t2", "disk", None), ("t3", "cpu", None)]);
    staged(queue.stage("c1", "r1", &data).unwrap());
    queue.drain().unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 3);
}

#[test]
fn processor_failure_rolls_back_the_whole_report() {
    let dir = TempDir::new().unwrap();
    let (operational, telemetry) = open_databases(&dir);
    let registry = TelemetryProcessorRegistry::builder()
        .default_processor(DefaultProcessor)
        .register("bad", RejectingProcessor)
        .build()
        .unwrap();
    let queue = StagingQueue::new(operational, telemetry, Arc::new(registry));
    let data = report_json("r1", &[("t1", "cpu", None), ("t2", "bad", None)]);
    staged(queue.stage("c1", "r1", &data).unwrap());
    let report = queue.claim_next().unwrap().unwrap();
    assert!(matches!(queue.process(&report), Err(StoreError::Processor(_))));
    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 0);
    assert_eq!(count_rows(queue.operational(), "reports"), 1);
}

#[test]
fn processor_opening_a_session_fails_instead_of_blocking() {
    let dir = TempDir::new().unwrap();
    let (operational, telemetry) = open_databases(&dir);
    let registry = TelemetryProcessorRegistry::builder()
        .default_processor(SessionOpeningProcessor)
        .build()
        .unwrap();
    let queue = StagingQueue::new(operational, telemetry, Arc::new(registry));
    staged(queue.stage("c1", "r1", &report_json("r1", &[("t1", "cpu", None)])).unwrap());
    let report = queue.claim_next().unwrap().unwrap();
    let result = queue.process(&report);
    assert!(matches!(result, Err(StoreError::Db(DbError::Usage(_)))), "{result:?}");
    assert_eq!(count_rows(queue.operational(), "reports"), 1);
    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 0);
}

// ============================================================================
// SECTION: Drain
// ============================================================================

#[test]
fn drain_isolates_failed_reports() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    staged(queue.stage("c1", "r1", &report_json("r1", &[("t1", "cpu", None)])).unwrap());
    let bad = staged(queue.stage("c1", "r2", "{}").unwrap());
    staged(queue.stage("c1", "r3", &report_json("r3", &[("t1", "cpu", None)])).unwrap());

    let err = queue.drain().unwrap_err();
    assert_eq!(err.summary.processed, 2);
    assert_eq!(err.summary.failed, 1);
    assert_eq!(err.failures.len(), 1);
    assert_eq!(err.failures[0].staged_id, Some(bad));
    assert_eq!(err.failures[0].report_id.as_deref(), Some("r2"));
    assert!(err.to_string().contains("report r2"));

    assert_eq!(count_rows(queue.telemetry(), "telemetryData"), 2);
    assert_eq!(queue.depth().unwrap(), 0);
    let stuck = queue.stale_claims(Duration::ZERO).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].report_id, "r2");
}

#[test]
fn drain_of_empty_queue_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let queue = open_queue(&dir);
    let summary = queue.drain().unwrap();
    assert_eq!(summary.processed, 0);
    assert_eq!(summary.failed, 0);
}

// ============================================================================
// SECTION: Schema Upgrade
// ============================================================================

#[test]
fn operational_upgrade_adds_allocation_timestamp() {
    let dir = TempDir::new().unwrap();
    let config = DatabaseConfig::sqlite(&dir.path().join("operational.db"));
    let db = operational_db(&config).unwrap();
    db.connect().unwrap();
    {
        let mut session = db.session().unwrap();
        session.batch_execute(&db_version_spec().unwrap().create_cmd(Dialect::Sqlite)).unwrap();
        session.batch_execute(&clients_spec().unwrap().create_cmd(Dialect::Sqlite)).unwrap();
        session
            .batch_execute(
                "CREATE TABLE \"reports\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT, \"clientId\" \
                 TEXT NOT NULL, \"reportId\" TEXT NOT NULL, \"data\" TEXT NOT NULL, \
                 \"receivedAt\" TEXT NOT NULL, \"allocated\" BOOLEAN NOT NULL DEFAULT false, \
                 UNIQUE (\"clientId\", \"reportId\"))",
            )
            .unwrap();
        DbVersion::new(&db, "1.0.0", datetime!(2024-02-05 00:00 UTC))
            .unwrap()
            .insert(&mut session)
            .unwrap();
    }

    let outcome = db.initialize().unwrap();
    assert_eq!(outcome, MigrationOutcome::Migrated {
        from: "1.0.0".to_string(),
        to: "1.1.0".to_string(),
        applied: 1,
    });
    let columns = db
        .session()
        .unwrap()
        .query("SELECT \"name\" FROM pragma_table_info('reports')", &[])
        .unwrap();
    assert!(columns.iter().any(|row| row.get_string("name").unwrap() == "allocatedAt"));

    let queue = StagingQueue::new(
        Arc::clone(&db),
        telemetry_db(&DatabaseConfig::sqlite(&dir.path().join("telemetry.db"))).unwrap(),
        Arc::new(TelemetryProcessorRegistry::standard()),
    );
    staged(queue.stage("c1", "r1", "{}").unwrap());
    assert!(queue.claim_next().unwrap().unwrap().allocated_at.is_some());
}
