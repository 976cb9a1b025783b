// crates/telemetry-db/src/executor.rs
// ============================================================================
// Module: Executors
// Description: Leased connections, transactions, and the execution surface.
// Purpose: Run parameterized SQL identically on every backend.
// Dependencies: postgres, r2d2, r2d2_postgres, rusqlite, tracing
// ============================================================================

//! ## Overview
//! A [`Session`] is a connection leased from a backend: a mutex guard over
//! the single connection of `SQLite` and plain Postgres, or a pooled
//! connection. A [`Transaction`] owns a session between `BEGIN` and
//! `COMMIT`/`ROLLBACK` and rolls back on drop unless committed. Both
//! implement [`Executor`], so code that persists rows accepts either.
//!
//! `SQLite` transactions start with `BEGIN IMMEDIATE`, taking the database
//! write lock up front; Postgres transactions use the server default
//! (read committed).
//!
//! Single-connection backends hand out one session at a time. A thread that
//! requests a second session from the same backend while holding one gets
//! [`DbError::Usage`] rather than blocking on itself.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::MutexGuard;

use postgres::NoTls;
use postgres::types::ToSql;
use r2d2::PooledConnection;
use r2d2_postgres::PostgresConnectionManager;
use rusqlite::params_from_iter;
use tracing::warn;

use crate::backend::SessionHold;
use crate::dialect::Dialect;
use crate::error::DbError;
use crate::value::SqlRow;
use crate::value::SqlValue;
use crate::value::postgres_value;
use crate::value::sqlite_value;

// ============================================================================
// SECTION: Executor
// ============================================================================

/// Anything that can run parameterized SQL.
pub trait Executor {
    /// Returns the dialect of the underlying connection.
    fn dialect(&self) -> Dialect;

    /// Executes a statement and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when the backend rejects the statement.
    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError>;

    /// Executes a query and returns every result row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when the backend rejects the query or
    /// [`DbError::Decode`] when a value cannot be decoded.
    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError>;

    /// Executes one or more statements without parameters.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when the backend rejects a statement.
    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError>;

    /// Executes a query and returns the first row, if any.
    ///
    /// # Errors
    ///
    /// Propagates [`Executor::query`] failures.
    fn query_opt(&mut self, sql: &str, params: &[SqlValue]) -> Result<Option<SqlRow>, DbError> {
        Ok(self.query(sql, params)?.into_iter().next())
    }
}

// ============================================================================
// SECTION: Sessions
// ============================================================================

/// Pooled Postgres connection type.
pub(crate) type PooledPgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

/// Mutable access to the driver connection behind a session.
pub enum RawConnection<'a> {
    /// `SQLite` connection.
    Sqlite(&'a mut rusqlite::Connection),
    /// Postgres client, plain or pooled.
    Postgres(&'a mut postgres::Client),
}

/// Lease held by a session.
enum Lease<'a> {
    /// Guard over the single `SQLite` connection.
    Sqlite(MutexGuard<'a, Option<rusqlite::Connection>>),
    /// Guard over the single plain Postgres client.
    Postgres(MutexGuard<'a, Option<postgres::Client>>),
    /// Connection checked out of a pool.
    Pooled(Box<PooledPgConnection>),
}

/// A connection leased from a backend.
pub struct Session<'a> {
    /// Underlying lease.
    lease: Lease<'a>,
    /// Re-entry marker for single-connection backends.
    _hold: Option<SessionHold>,
}

impl<'a> Session<'a> {
    /// Wraps the guarded `SQLite` connection.
    pub(crate) fn sqlite(
        guard: MutexGuard<'a, Option<rusqlite::Connection>>,
        hold: SessionHold,
    ) -> Self {
        Self {
            lease: Lease::Sqlite(guard),
            _hold: Some(hold),
        }
    }

    /// Wraps the guarded plain Postgres client.
    pub(crate) fn postgres(
        guard: MutexGuard<'a, Option<postgres::Client>>,
        hold: SessionHold,
    ) -> Self {
        Self {
            lease: Lease::Postgres(guard),
            _hold: Some(hold),
        }
    }

    /// Wraps a pooled Postgres connection.
    pub(crate) fn pooled(connection: PooledPgConnection) -> Self {
        Self {
            lease: Lease::Pooled(Box::new(connection)),
            _hold: None,
        }
    }

    /// Returns the driver connection for operations the engine does not wrap.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] when the backend was closed underneath the
    /// session.
    pub fn raw(&mut self) -> Result<RawConnection<'_>, DbError> {
        let closed = || DbError::Closed("session connection is closed".to_string());
        match &mut self.lease {
            Lease::Sqlite(guard) => guard.as_mut().map(RawConnection::Sqlite).ok_or_else(closed),
            Lease::Postgres(guard) => {
                guard.as_mut().map(RawConnection::Postgres).ok_or_else(closed)
            }
            Lease::Pooled(connection) => Ok(RawConnection::Postgres(&mut ***connection)),
        }
    }

    /// Begins a transaction on this session.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when `BEGIN` fails.
    pub fn begin(mut self) -> Result<Transaction<'a>, DbError> {
        let begin = match self.dialect() {
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Postgres => "BEGIN",
        };
        self.batch_execute(begin)?;
        Ok(Transaction {
            session: self,
            open: true,
        })
    }
}

impl Executor for Session<'_> {
    fn dialect(&self) -> Dialect {
        match self.lease {
            Lease::Sqlite(_) => Dialect::Sqlite,
            Lease::Postgres(_) | Lease::Pooled(_) => Dialect::Postgres,
        }
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        match self.raw()? {
            RawConnection::Sqlite(connection) => {
                let changed = connection.execute(sql, params_from_iter(params.iter()))?;
                Ok(u64::try_from(changed).unwrap_or(u64::MAX))
            }
            RawConnection::Postgres(client) => Ok(client.execute(sql, &postgres_params(params))?),
        }
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        match self.raw()? {
            RawConnection::Sqlite(connection) => sqlite_query(connection, sql, params),
            RawConnection::Postgres(client) => {
                let rows = client.query(sql, &postgres_params(params))?;
                rows.iter()
                    .map(|row| {
                        let columns =
                            row.columns().iter().map(|column| column.name().to_string()).collect();
                        let values = (0 .. row.len())
                            .map(|index| postgres_value(row, index))
                            .collect::<Result<Vec<_>, _>>()?;
                        SqlRow::new(columns, values)
                    })
                    .collect()
            }
        }
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        match self.raw()? {
            RawConnection::Sqlite(connection) => Ok(connection.execute_batch(sql)?),
            RawConnection::Postgres(client) => Ok(client.batch_execute(sql)?),
        }
    }
}

/// Runs a query on `SQLite` and decodes every row.
fn sqlite_query(
    connection: &rusqlite::Connection,
    sql: &str,
    params: &[SqlValue],
) -> Result<Vec<SqlRow>, DbError> {
    let mut statement = connection.prepare(sql)?;
    let columns: Vec<String> =
        statement.column_names().into_iter().map(ToString::to_string).collect();
    let mut rows = statement.query(params_from_iter(params.iter()))?;
    let mut decoded = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(columns.len());
        for index in 0 .. columns.len() {
            values.push(sqlite_value(row.get_ref(index)?)?);
        }
        decoded.push(SqlRow::new(columns.clone(), values)?);
    }
    Ok(decoded)
}

/// Borrows values as Postgres parameters.
fn postgres_params(params: &[SqlValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|value| value as &(dyn ToSql + Sync)).collect()
}

// ============================================================================
// SECTION: Transactions
// ============================================================================

/// An open transaction on a leased session.
///
/// # Invariants
/// - Dropping an uncommitted transaction issues `ROLLBACK`.
pub struct Transaction<'a> {
    /// Session the transaction runs on.
    session: Session<'a>,
    /// Whether `COMMIT`/`ROLLBACK` is still outstanding.
    open: bool,
}

impl Transaction<'_> {
    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when `COMMIT` fails; the transaction is
    /// rolled back before returning.
    pub fn commit(mut self) -> Result<(), DbError> {
        self.open = false;
        if let Err(err) = self.session.batch_execute("COMMIT") {
            if let Err(rollback) = self.session.batch_execute("ROLLBACK") {
                warn!(error = %rollback, "rollback after failed commit also failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Exec`] when `ROLLBACK` fails.
    pub fn rollback(mut self) -> Result<(), DbError> {
        self.open = false;
        self.session.batch_execute("ROLLBACK")
    }

    /// Returns the driver connection the transaction runs on.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Closed`] when the backend was closed.
    pub fn raw(&mut self) -> Result<RawConnection<'_>, DbError> {
        self.session.raw()
    }
}

impl Executor for Transaction<'_> {
    fn dialect(&self) -> Dialect {
        self.session.dialect()
    }

    fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<u64, DbError> {
        self.session.execute(sql, params)
    }

    fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<SqlRow>, DbError> {
        self.session.query(sql, params)
    }

    fn batch_execute(&mut self, sql: &str) -> Result<(), DbError> {
        self.session.batch_execute(sql)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            if let Err(err) = self.session.batch_execute("ROLLBACK") {
                warn!(error = %err, "rollback of abandoned transaction failed");
            }
        }
    }
}
