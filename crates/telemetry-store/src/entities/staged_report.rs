// crates/telemetry-store/src/entities/staged_report.rs
// ============================================================================
// Module: Staged Report Entity
// Description: Inbound reports awaiting decomposition.
// Purpose: Durable rows of the staging queue.
// Dependencies: telemetry-db, time
// ============================================================================

//! ## Overview
//! A staged report is claimed by flipping `allocated` to true and stamping
//! `allocatedAt`; the claim is released only by deleting the row after
//! successful processing. The claim update matches on `allocated = false`
//! as well as the id, so a row already claimed by another transaction is
//! never claimed twice.

use std::sync::Arc;
use std::sync::LazyLock;

use telemetry_db::AppDb;
use telemetry_db::Column;
use telemetry_db::DbError;
use telemetry_db::Executor;
use telemetry_db::Row;
use telemetry_db::RowState;
use telemetry_db::SqlRow;
use telemetry_db::SqlType;
use telemetry_db::SqlValue;
use telemetry_db::TableSpec;
use telemetry_db::unknown_column;
use telemetry_db::update_statement;
use time::OffsetDateTime;

use super::SpecCell;
use super::client::CLIENTS_TABLE;
use super::spec_ref;

/// Name of the staging table.
pub const REPORTS_TABLE: &str = "reports";

/// Specification of the staging table.
static REPORTS: SpecCell = LazyLock::new(|| {
    TableSpec::builder(REPORTS_TABLE)
        .column(Column::identity("id"))
        .column(Column::new("clientId", SqlType::Text))
        .column(Column::new("reportId", SqlType::Text))
        .column(Column::new("data", SqlType::Text))
        .column(Column::new("receivedAt", SqlType::Timestamp))
        .column(Column::new("allocated", SqlType::Boolean).default_literal("false"))
        .column(Column::new("allocatedAt", SqlType::Timestamp).nullable())
        .foreign_key("clientId", CLIENTS_TABLE, "clientId")
        .extra("UNIQUE (\"clientId\", \"reportId\")")
        .build()
});

/// Returns the staging table specification.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the specification is malformed.
pub fn reports_spec() -> Result<&'static TableSpec, DbError> {
    spec_ref(&REPORTS)
}

/// A staged report.
#[derive(Debug, Clone)]
pub struct StagedReport {
    /// Row state.
    state: RowState,
    /// Backend-assigned id; claim order follows it.
    pub id: Option<i64>,
    /// Submitting client.
    pub client_id: String,
    /// Report identifier, unique per client.
    pub report_id: String,
    /// Opaque JSON payload.
    pub data: String,
    /// Time the report was staged.
    pub received_at: OffsetDateTime,
    /// Whether a worker claimed the report.
    pub allocated: bool,
    /// Time of the claim.
    pub allocated_at: Option<OffsetDateTime>,
}

impl StagedReport {
    /// Creates an unsaved, unallocated report received now.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the table specification is malformed.
    pub fn new(
        db: &Arc<AppDb>,
        client_id: &str,
        report_id: &str,
        data: &str,
    ) -> Result<Self, DbError> {
        Ok(Self {
            state: RowState::new(db, reports_spec()?),
            id: None,
            client_id: client_id.to_string(),
            report_id: report_id.to_string(),
            data: data.to_string(),
            received_at: OffsetDateTime::now_utc(),
            allocated: false,
            allocated_at: None,
        })
    }

    /// Decodes a fetched row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when a column is missing or mistyped.
    pub fn from_row(db: &Arc<AppDb>, row: &SqlRow) -> Result<Self, DbError> {
        let mut report = Self::new(db, "", "", "")?;
        report.load(row)?;
        Ok(report)
    }

    /// Claims the report at `now` if it is still unallocated; returns whether
    /// this call made the claim.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] for an unsaved row and propagates
    /// execution failures.
    pub fn mark_allocated(
        &mut self,
        executor: &mut dyn Executor,
        now: OffsetDateTime,
    ) -> Result<bool, DbError> {
        let Some(id) = self.id else {
            return Err(DbError::Validation("cannot claim an unsaved report".to_string()));
        };
        let dialect = self.state.dialect_for(executor)?;
        let statement =
            update_statement(self.state.spec(), dialect, &["allocated", "allocatedAt"], &[
                "id",
                "allocated",
            ])?;
        let params = [
            SqlValue::Bool(true),
            SqlValue::Timestamp(now),
            SqlValue::Integer(id),
            SqlValue::Bool(false),
        ];
        let claimed = executor.execute(&statement.sql, &params)? == 1;
        if claimed {
            self.allocated = true;
            self.allocated_at = Some(now);
        }
        Ok(claimed)
    }
}

impl Row for StagedReport {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["clientId", "reportId"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "clientId" => Ok(SqlValue::from(self.client_id.as_str())),
                "reportId" => Ok(SqlValue::from(self.report_id.as_str())),
                "data" => Ok(SqlValue::from(self.data.as_str())),
                "receivedAt" => Ok(SqlValue::from(self.received_at)),
                "allocated" => Ok(SqlValue::from(self.allocated)),
                "allocatedAt" => Ok(SqlValue::from(self.allocated_at)),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.client_id = row.get_string("clientId")?;
        self.report_id = row.get_string("reportId")?;
        self.data = row.get_string("data")?;
        self.received_at = row.get_timestamp("receivedAt")?;
        self.allocated = row.get_bool("allocated")?;
        self.allocated_at = row.get_opt_timestamp("allocatedAt")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}
