// crates/telemetry-store/src/entities/customer.rs
// ============================================================================
// Module: Customer Entity
// Description: Customers telemetry is attributed to.
// Purpose: Normalize customer identifiers into integer keys.
// Dependencies: telemetry-db
// ============================================================================

//! ## Overview
//! Customer identifiers arrive as free text on each telemetry item. They are
//! resolved to integer keys on first sight, and items without one are
//! attributed to [`UNKNOWN_CUSTOMER`].

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

use super::SpecCell;
use super::resolve_row;
use super::spec_ref;

/// Name of the customers table.
pub const CUSTOMERS_TABLE: &str = "customers";
/// Customer recorded for telemetry that names none.
pub const UNKNOWN_CUSTOMER: &str = "UNKNOWN";

/// Specification of the customers table.
static CUSTOMERS: SpecCell = LazyLock::new(|| {
    TableSpec::builder(CUSTOMERS_TABLE)
        .column(Column::identity("id"))
        .column(Column::new("customerId", SqlType::Text).unique())
        .build()
});

/// Returns the customers table specification.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the specification is malformed.
pub fn customers_spec() -> Result<&'static TableSpec, DbError> {
    spec_ref(&CUSTOMERS)
}

/// A customer.
#[derive(Debug, Clone)]
pub struct Customer {
    /// Row state.
    state: RowState,
    /// Backend-assigned id.
    pub id: Option<i64>,
    /// External customer identifier.
    pub customer_id: String,
}

impl Customer {
    /// Creates an unsaved customer.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the table specification is malformed.
    pub fn new(db: &Arc<AppDb>, customer_id: &str) -> Result<Self, DbError> {
        Ok(Self {
            state: RowState::new(db, customers_spec()?),
            id: None,
            customer_id: customer_id.to_string(),
        })
    }

    /// Returns the stored customer, creating it on first use.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn resolve(db: &Arc<AppDb>, customer_id: &str) -> Result<Self, DbError> {
        let mut customer = Self::new(db, customer_id)?;
        resolve_row(db, &mut customer)?;
        Ok(customer)
    }
}

impl Row for Customer {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["customerId"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "customerId" => Ok(SqlValue::from(self.customer_id.as_str())),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.customer_id = row.get_string("customerId")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}
