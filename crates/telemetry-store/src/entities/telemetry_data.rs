// crates/telemetry-store/src/entities/telemetry_data.rs
// ============================================================================
// Module: Telemetry Data Entity
// Description: One decoded telemetry item.
// Purpose: Generic storage for telemetry types without a dedicated table.
// Dependencies: telemetry-db, time
// ============================================================================

//! ## Overview
//! Generic home for decoded items. Each row references its customer and,
//! when annotated, its tag set. An item is identified by client, report, and
//! telemetry id, which makes reprocessing a report a no-op.

use std::sync::Arc;
use std::sync::LazyLock;

use telemetry_db::AppDb;
use telemetry_db::Column;
use telemetry_db::DbError;
use telemetry_db::Row;
use telemetry_db::RowState;
use telemetry_db::SqlRow;
use telemetry_db::SqlType;
use telemetry_db::SqlValue;
use telemetry_db::TableSpec;
use telemetry_db::unknown_column;
use time::OffsetDateTime;

use super::SpecCell;
use super::customer::CUSTOMERS_TABLE;
use super::spec_ref;
use super::tag_set::TAG_SETS_TABLE;

/// Name of the telemetry data table.
pub const TELEMETRY_DATA_TABLE: &str = "telemetryData";

/// Specification of the telemetry data table.
static TELEMETRY_DATA: SpecCell = LazyLock::new(|| {
    TableSpec::builder(TELEMETRY_DATA_TABLE)
        .column(Column::identity("id"))
        .column(Column::new("customerId", SqlType::Integer))
        .column(Column::new("tagSetId", SqlType::Integer).nullable())
        .column(Column::new("clientId", SqlType::Text))
        .column(Column::new("reportId", SqlType::Text))
        .column(Column::new("telemetryId", SqlType::Text))
        .column(Column::new("telemetryType", SqlType::Text))
        .column(Column::new("telemetryTimeStamp", SqlType::Timestamp))
        .column(Column::new("data", SqlType::Text))
        .foreign_key("customerId", CUSTOMERS_TABLE, "id")
        .foreign_key("tagSetId", TAG_SETS_TABLE, "id")
        .extra("UNIQUE (\"clientId\", \"reportId\", \"telemetryId\")")
        .build()
});

/// Returns the telemetry data table specification.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the specification is malformed.
pub fn telemetry_data_spec() -> Result<&'static TableSpec, DbError> {
    spec_ref(&TELEMETRY_DATA)
}

/// One stored telemetry item.
#[derive(Debug, Clone)]
pub struct TelemetryData {
    /// Row state.
    state: RowState,
    /// Backend-assigned id.
    pub id: Option<i64>,
    /// Key of the owning customer.
    pub customer_id: i64,
    /// Key of the item's tag set, if annotated.
    pub tag_set_id: Option<i64>,
    /// Submitting client.
    pub client_id: String,
    /// Report the item arrived in.
    pub report_id: String,
    /// Item identifier, unique within its report.
    pub telemetry_id: String,
    /// Telemetry type name.
    pub telemetry_type: String,
    /// Time the item was produced.
    pub telemetry_time_stamp: OffsetDateTime,
    /// Item data as JSON text.
    pub data: String,
}

/// Identity and content of a telemetry item to store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryDataFields {
    /// Key of the owning customer.
    pub customer_id: i64,
    /// Key of the item's tag set, if annotated.
    pub tag_set_id: Option<i64>,
    /// Submitting client.
    pub client_id: String,
    /// Report the item arrived in.
    pub report_id: String,
    /// Item identifier.
    pub telemetry_id: String,
    /// Telemetry type name.
    pub telemetry_type: String,
    /// Time the item was produced.
    pub telemetry_time_stamp: OffsetDateTime,
    /// Item data as JSON text.
    pub data: String,
}

impl TelemetryData {
    /// Creates an unsaved row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the table specification is malformed.
    pub fn new(db: &Arc<AppDb>, fields: TelemetryDataFields) -> Result<Self, DbError> {
        Ok(Self {
            state: RowState::new(db, telemetry_data_spec()?),
            id: None,
            customer_id: fields.customer_id,
            tag_set_id: fields.tag_set_id,
            client_id: fields.client_id,
            report_id: fields.report_id,
            telemetry_id: fields.telemetry_id,
            telemetry_type: fields.telemetry_type,
            telemetry_time_stamp: fields.telemetry_time_stamp,
            data: fields.data,
        })
    }
}

impl Row for TelemetryData {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["clientId", "reportId", "telemetryId"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "customerId" => Ok(SqlValue::from(self.customer_id)),
                "tagSetId" => Ok(SqlValue::from(self.tag_set_id)),
                "clientId" => Ok(SqlValue::from(self.client_id.as_str())),
                "reportId" => Ok(SqlValue::from(self.report_id.as_str())),
                "telemetryId" => Ok(SqlValue::from(self.telemetry_id.as_str())),
                "telemetryType" => Ok(SqlValue::from(self.telemetry_type.as_str())),
                "telemetryTimeStamp" => Ok(SqlValue::from(self.telemetry_time_stamp)),
                "data" => Ok(SqlValue::from(self.data.as_str())),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.customer_id = row.get_i64("customerId")?;
        self.tag_set_id = row.get_opt_i64("tagSetId")?;
        self.client_id = row.get_string("clientId")?;
        self.report_id = row.get_string("reportId")?;
        self.telemetry_id = row.get_string("telemetryId")?;
        self.telemetry_type = row.get_string("telemetryType")?;
        self.telemetry_time_stamp = row.get_timestamp("telemetryTimeStamp")?;
        self.data = row.get_string("data")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}
