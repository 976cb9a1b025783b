// crates/telemetry-store/src/entities/client.rs
// ============================================================================
// Module: Client Entity
// Description: Registered reporting clients in the Operational database.
// Purpose: Track which clients submit reports and when they were last seen.
// Dependencies: telemetry-db, time
// ============================================================================

//! ## Overview
//! One row per reporting client, keyed by its client identifier. Staging a
//! report calls [`Client::touch`], which registers unseen clients and moves
//! `lastSeenAt` forward for known ones inside the staging transaction.

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
use time::OffsetDateTime;

use super::SpecCell;
use super::spec_ref;

/// Name of the clients table.
pub const CLIENTS_TABLE: &str = "clients";

/// Specification of the clients table.
static CLIENTS: SpecCell = LazyLock::new(|| {
    TableSpec::builder(CLIENTS_TABLE)
        .column(Column::identity("id"))
        .column(Column::new("clientId", SqlType::Text).unique())
        .column(Column::new("registeredAt", SqlType::Timestamp))
        .column(Column::new("lastSeenAt", SqlType::Timestamp).nullable())
        .build()
});

/// Returns the clients table specification.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the specification is malformed.
pub fn clients_spec() -> Result<&'static TableSpec, DbError> {
    spec_ref(&CLIENTS)
}

/// A reporting client.
#[derive(Debug, Clone)]
pub struct Client {
    /// Row state.
    state: RowState,
    /// Backend-assigned id.
    pub id: Option<i64>,
    /// Client identifier presented by the client.
    pub client_id: String,
    /// First time the client was seen.
    pub registered_at: OffsetDateTime,
    /// Most recent report submission.
    pub last_seen_at: Option<OffsetDateTime>,
}

impl Client {
    /// Creates an unsaved client registered now.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the table specification is malformed.
    pub fn new(db: &Arc<AppDb>, client_id: &str) -> Result<Self, DbError> {
        Ok(Self {
            state: RowState::new(db, clients_spec()?),
            id: None,
            client_id: client_id.to_string(),
            registered_at: OffsetDateTime::now_utc(),
            last_seen_at: None,
        })
    }

    /// Registers the client on first sight and records `now` as last seen.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn touch(
        db: &Arc<AppDb>,
        executor: &mut dyn Executor,
        client_id: &str,
        now: OffsetDateTime,
    ) -> Result<Self, DbError> {
        let mut client = Self::new(db, client_id)?;
        if client.exists(executor)? {
            client.last_seen_at = Some(now);
            client.update(executor)?;
        } else {
            client.registered_at = now;
            client.last_seen_at = Some(now);
            client.insert(executor)?;
        }
        Ok(client)
    }
}

impl Row for Client {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["clientId"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "clientId" => Ok(SqlValue::from(self.client_id.as_str())),
                "registeredAt" => Ok(SqlValue::from(self.registered_at)),
                "lastSeenAt" => Ok(SqlValue::from(self.last_seen_at)),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.client_id = row.get_string("clientId")?;
        self.registered_at = row.get_timestamp("registeredAt")?;
        self.last_seen_at = row.get_opt_timestamp("lastSeenAt")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}
