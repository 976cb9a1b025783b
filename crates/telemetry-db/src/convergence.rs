// crates/telemetry-db/src/convergence.rs
// ============================================================================
// Module: Schema Convergence
// Description: Race-tolerant "create table if absent" protocol.
// Purpose: Let many processes start against one database at the same time.
// Dependencies: crate::backend, crate::table, tracing
// ============================================================================

//! ## Overview
//! [`create_table_from_spec`] renders the table DDL and runs it inside a
//! transaction holding the transaction-scoped create-table advisory lock, so
//! concurrent creators on Postgres take turns. Any failure rolls back and
//! is then reconciled against the catalog on a fresh session: if the table
//! exists, another process won the race and the failure is downgraded to
//! success. If the catalog check itself fails, convergence of that table
//! fails with both errors.

// ============================================================================
// SECTION: Imports
// ============================================================================

use tracing::debug;
use tracing::warn;

use crate::backend::CREATE_TABLE_LOCK_ID;
use crate::backend::ConnectionManager;
use crate::backend::LockRequest;
use crate::dialect::Dialect;
use crate::error::DbError;
use crate::executor::Executor;
use crate::table::TableSpec;
use crate::value::SqlValue;

// ============================================================================
// SECTION: Catalog
// ============================================================================

/// Returns true when a table named `name` exists in the current schema.
///
/// # Errors
///
/// Returns [`DbError::Exec`] when the catalog query fails.
pub fn table_exists(executor: &mut dyn Executor, name: &str) -> Result<bool, DbError> {
    let sql = match executor.dialect() {
        Dialect::Sqlite => {
            "SELECT COUNT(*) AS \"count\" FROM sqlite_master WHERE type = 'table' AND name = ?"
        }
        Dialect::Postgres => {
            "SELECT COUNT(*) AS \"count\" FROM information_schema.tables WHERE table_schema = \
             current_schema() AND table_name = $1"
        }
    };
    let row = executor
        .query_opt(sql, &[SqlValue::from(name)])?
        .ok_or_else(|| DbError::Decode("catalog count returned no row".to_string()))?;
    Ok(row.get_i64("count")? > 0)
}

// ============================================================================
// SECTION: Convergence
// ============================================================================

/// Ensures the table described by `spec` exists.
///
/// # Errors
///
/// Returns the creation failure when the table still does not exist
/// afterwards, or [`DbError::Exec`] carrying both failures when the catalog
/// cannot be consulted.
pub fn create_table_from_spec(
    manager: &ConnectionManager,
    spec: &TableSpec,
) -> Result<(), DbError> {
    let ddl = spec.create_cmd(manager.dialect());
    let Err(err) = run_create(manager, &ddl) else {
        debug!(database = manager.name(), table = spec.name(), "table converged");
        return Ok(());
    };
    let exists = manager.session().and_then(|mut session| table_exists(&mut session, spec.name()));
    match exists {
        Ok(true) => {
            warn!(
                database = manager.name(),
                table = spec.name(),
                error = %err,
                "table creation failed but table exists; treating as concurrent creation"
            );
            Ok(())
        }
        Ok(false) => Err(err),
        Err(check) => Err(DbError::Exec(format!(
            "create table {} failed ({err}) and existence check failed: {check}",
            spec.name()
        ))),
    }
}

/// Runs the DDL under the create-table lock in one transaction.
fn run_create(manager: &ConnectionManager, ddl: &str) -> Result<(), DbError> {
    let mut tx = manager.begin()?;
    let result = manager
        .lock(&mut tx, LockRequest::transaction(CREATE_TABLE_LOCK_ID))
        .and_then(|()| tx.batch_execute(ddl));
    match result {
        Ok(()) => tx.commit(),
        Err(err) => {
            if let Err(rollback) = tx.rollback() {
                warn!(database = manager.name(), error = %rollback, "rollback of create failed");
            }
            Err(err)
        }
    }
}
