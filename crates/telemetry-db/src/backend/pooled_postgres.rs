// crates/telemetry-db/src/backend/pooled_postgres.rs
// ============================================================================
// Module: Pooled Postgres Backend
// Description: r2d2 pool of Postgres clients.
// Purpose: Share connections across concurrent request handlers.
// Dependencies: postgres, r2d2, r2d2_postgres
// ============================================================================

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;

use super::Backend;
use super::DatabaseConfig;
use super::PoolLimits;
use super::plain_postgres::parse_config;
use crate::error::DbError;
use crate::executor::Session;

/// Pool type used by the backend.
type PgPool = Pool<PostgresConnectionManager<NoTls>>;

/// Pooled Postgres backend.
///
/// # Invariants
/// - Pool size never exceeds `limits.max_connections`.
/// - `None` means not yet connected or closed.
pub(super) struct PooledPostgresBackend {
    /// Parsed connection parameters.
    config: postgres::Config,
    /// Pool sizing.
    limits: PoolLimits,
    /// Checkout timeout.
    checkout_timeout: Duration,
    /// The pool, once built.
    pool: Mutex<Option<PgPool>>,
}

impl PooledPostgresBackend {
    /// Parses the connection URI and records pool limits.
    pub(super) fn new(config: &DatabaseConfig, limits: PoolLimits) -> Result<Self, DbError> {
        Ok(Self {
            config: parse_config(config)?,
            limits,
            checkout_timeout: Duration::from_millis(config.connect_timeout_ms),
            pool: Mutex::new(None),
        })
    }

    /// Locks the pool slot.
    fn slot(&self) -> Result<MutexGuard<'_, Option<PgPool>>, DbError> {
        self.pool.lock().map_err(|_| DbError::Exec("postgres pool mutex poisoned".to_string()))
    }
}

impl Backend for PooledPostgresBackend {
    fn connect(&self) -> Result<(), DbError> {
        let mut slot = self.slot()?;
        if slot.is_some() {
            return Ok(());
        }
        let manager = PostgresConnectionManager::new(self.config.clone(), NoTls);
        let pool = Pool::builder()
            .max_size(self.limits.max_connections)
            .min_idle(Some(self.limits.min_idle))
            .connection_timeout(self.checkout_timeout)
            .build(manager)
            .map_err(|err| DbError::Connect(err.to_string()))?;
        *slot = Some(pool);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot().is_ok_and(|slot| slot.is_some())
    }

    fn close(&self) -> Result<(), DbError> {
        if let Some(pool) = self.slot()?.take() {
            // r2d2 joins its workers on drop; keep that off async executors.
            let _ = std::thread::spawn(move || drop(pool));
        }
        Ok(())
    }

    fn session(&self) -> Result<Session<'_>, DbError> {
        let pool = self
            .slot()?
            .clone()
            .ok_or_else(|| DbError::Closed("postgres pool is not connected".to_string()))?;
        let connection = pool.get().map_err(|err| DbError::Connect(err.to_string()))?;
        Ok(Session::pooled(connection))
    }
}

impl Drop for PooledPostgresBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
