// crates/telemetry-store/src/databases.rs
// ============================================================================
// Module: Logical Databases
// Description: Operational and Telemetry database declarations.
// Purpose: Bind each logical database to its tables and migrations.
// Dependencies: telemetry-db, time
// ============================================================================

//! ## Overview
//! - **Operational** holds registered clients and the staging queue.
//! - **Telemetry** holds customers, tag sets, and decoded telemetry.
//!
//! Tables are listed in creation order so foreign keys resolve. Both
//! databases start at `1.0.0`; Operational `1.1.0` adds `allocatedAt` to
//! staging tables created before stale-claim detection existed.

use std::sync::Arc;

use telemetry_db::AppDb;
use telemetry_db::DatabaseConfig;
use telemetry_db::DbError;
use telemetry_db::Executor;
use telemetry_db::Migration;
use telemetry_db::MigrationSet;
use telemetry_db::SqlType;
use time::macros::datetime;

use crate::entities::client::clients_spec;
use crate::entities::customer::customers_spec;
use crate::entities::staged_report::REPORTS_TABLE;
use crate::entities::staged_report::reports_spec;
use crate::entities::tag_set::tag_sets_spec;
use crate::entities::telemetry_data::telemetry_data_spec;

/// Name of the operational database.
pub const OPERATIONAL: &str = "Operational";
/// Name of the telemetry database.
pub const TELEMETRY: &str = "Telemetry";

/// Migrations of the operational database, oldest first.
///
/// # Errors
///
/// Returns [`DbError::Config`] if the list is malformed.
pub fn operational_migrations() -> Result<MigrationSet, DbError> {
    MigrationSet::new(vec![
        Migration::baseline("1.0.0", datetime!(2024-02-05 00:00 UTC)),
        Migration::new("1.1.0", datetime!(2024-07-15 00:00 UTC), |db| {
            let sql = format!(
                "ALTER TABLE \"{REPORTS_TABLE}\" ADD COLUMN \"allocatedAt\" {} NULL",
                SqlType::Timestamp.render(db.dialect())
            );
            db.session()?.batch_execute(&sql)
        }),
    ])
}

/// Migrations of the telemetry database, oldest first.
///
/// # Errors
///
/// Returns [`DbError::Config`] if the list is malformed.
pub fn telemetry_migrations() -> Result<MigrationSet, DbError> {
    MigrationSet::new(vec![Migration::baseline("1.0.0", datetime!(2024-02-05 00:00 UTC))])
}

/// Declares the operational database. No I/O happens until connect.
///
/// # Errors
///
/// Returns [`DbError::Config`] for invalid configuration.
pub fn operational_db(config: &DatabaseConfig) -> Result<Arc<AppDb>, DbError> {
    AppDb::new(OPERATIONAL, config, &[clients_spec()?, reports_spec()?], operational_migrations()?)
}

/// Declares the telemetry database. No I/O happens until connect.
///
/// # Errors
///
/// Returns [`DbError::Config`] for invalid configuration.
pub fn telemetry_db(config: &DatabaseConfig) -> Result<Arc<AppDb>, DbError> {
    AppDb::new(
        TELEMETRY,
        config,
        &[customers_spec()?, tag_sets_spec()?, telemetry_data_spec()?],
        telemetry_migrations()?,
    )
}
