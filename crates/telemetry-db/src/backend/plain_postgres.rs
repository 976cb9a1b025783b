// crates/telemetry-db/src/backend/plain_postgres.rs
// ============================================================================
// Module: Plain Postgres Backend
// Description: Single mutex-guarded Postgres client.
// Purpose: Postgres access without pooling for low-concurrency processes.
// Dependencies: postgres
// ============================================================================

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use postgres::Client;
use postgres::NoTls;

use super::Backend;
use super::DatabaseConfig;
use super::SessionHold;
use crate::error::DbError;
use crate::error::postgres_error_text;
use crate::executor::Session;

/// Plain Postgres backend.
///
/// # Invariants
/// - `config` was parsed from the data source at construction.
/// - `None` means not yet connected or closed.
pub(super) struct PostgresBackend {
    /// Parsed connection parameters.
    config: postgres::Config,
    /// The client, once connected.
    client: Mutex<Option<Client>>,
}

impl PostgresBackend {
    /// Parses the connection URI.
    pub(super) fn new(config: &DatabaseConfig) -> Result<Self, DbError> {
        Ok(Self {
            config: parse_config(config)?,
            client: Mutex::new(None),
        })
    }

    /// Locks the client slot.
    fn slot(&self) -> Result<MutexGuard<'_, Option<Client>>, DbError> {
        self.client.lock().map_err(|_| DbError::Exec("postgres client mutex poisoned".to_string()))
    }
}

impl Backend for PostgresBackend {
    fn connect(&self) -> Result<(), DbError> {
        let mut slot = self.slot()?;
        if slot.is_some() {
            return Ok(());
        }
        let client = self
            .config
            .connect(NoTls)
            .map_err(|err| DbError::Connect(postgres_error_text(&err)))?;
        *slot = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot().is_ok_and(|slot| slot.as_ref().is_some_and(|client| !client.is_closed()))
    }

    fn close(&self) -> Result<(), DbError> {
        let Some(client) = self.slot()?.take() else {
            return Ok(());
        };
        client.close().map_err(|err| DbError::Exec(postgres_error_text(&err)))
    }

    fn session(&self) -> Result<Session<'_>, DbError> {
        let hold = SessionHold::acquire(self, "postgres")?;
        let slot = self.slot()?;
        if slot.is_none() {
            return Err(DbError::Closed("postgres client is not connected".to_string()));
        }
        Ok(Session::postgres(slot, hold))
    }
}

/// Parses a Postgres URI and applies the configured connect timeout.
pub(super) fn parse_config(config: &DatabaseConfig) -> Result<postgres::Config, DbError> {
    let mut parsed = config
        .source
        .parse::<postgres::Config>()
        .map_err(|err| DbError::Config(format!("invalid postgres data source: {err}")))?;
    parsed.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    Ok(parsed)
}
