// crates/telemetry-store/src/entities.rs
// ============================================================================
// Module: Entities
// Description: Persisted rows of the Operational and Telemetry databases.
// Purpose: Typed records built on the row persistence contract.
// Dependencies: telemetry-db
// ============================================================================

//! ## Overview
//! Each entity module owns its table specification and maps its typed
//! fields onto columns. Specifications are built once on first use and
//! shared read-only by every row of the table.
//!
//! Reference rows (customers, tag sets) are resolved with
//! [`resolve_row`]: look up, insert when absent, and on an insert failure
//! look up once more, since a concurrent resolver may have won the race.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod client;
pub mod customer;
pub mod staged_report;
pub mod tag_set;
pub mod telemetry_data;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::LazyLock;

use telemetry_db::AppDb;
use telemetry_db::DbError;
use telemetry_db::Row;
use telemetry_db::TableSpec;
use tracing::debug;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Lazily built table specification.
pub(crate) type SpecCell = LazyLock<Result<TableSpec, DbError>>;

/// Borrows a lazily built specification.
pub(crate) fn spec_ref(cell: &'static SpecCell) -> Result<&'static TableSpec, DbError> {
    cell.as_ref().map_err(Clone::clone)
}

/// Loads `row` by its lookup columns, inserting it when absent.
///
/// # Errors
///
/// Returns the insert failure when the row still cannot be found after it.
pub fn resolve_row<R: Row>(db: &AppDb, row: &mut R) -> Result<(), DbError> {
    if row.exists(&mut db.session()?)? {
        return Ok(());
    }
    let Err(err) = row.insert(&mut db.session()?) else {
        return Ok(());
    };
    if row.exists(&mut db.session()?)? {
        debug!(
            database = db.name(),
            table = row.state().spec().name(),
            "row inserted concurrently"
        );
        return Ok(());
    }
    Err(err)
}
