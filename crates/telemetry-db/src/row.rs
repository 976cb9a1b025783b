// crates/telemetry-db/src/row.rs
// ============================================================================
// Module: Row Persistence Contract
// Description: Shared row state and the exists/insert/update/delete surface.
// Purpose: Give every persisted entity the same statement plumbing.
// Dependencies: crate::app_db, crate::statement, crate::table
// ============================================================================

//! ## Overview
//! A concrete entity holds a [`RowState`] (its owning [`AppDb`] and its
//! immutable [`TableSpec`]) next to its typed fields, and implements
//! [`Row`] by mapping column names to values and back. The provided
//! methods then build and run statements through whatever [`Executor`] the
//! caller passes: a session for standalone writes, or a transaction when the
//! write belongs to a larger unit of work.
//!
//! Because [`RowState`] can only be built from a database and a
//! specification, a row that cannot address its table does not exist.
//! Running a row against an executor of another dialect than its database is
//! a [`DbError::Usage`] failure.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;

use crate::app_db::AppDb;
use crate::dialect::Dialect;
use crate::error::DbError;
use crate::executor::Executor;
use crate::statement::SelectOptions;
use crate::statement::Statement;
use crate::statement::delete_statement;
use crate::statement::insert_statement;
use crate::statement::select_statement;
use crate::statement::update_statement;
use crate::table::TableSpec;
use crate::value::SqlRow;
use crate::value::SqlValue;

// ============================================================================
// SECTION: Row State
// ============================================================================

/// State every persisted entity carries.
#[derive(Clone)]
pub struct RowState {
    /// Owning logical database.
    db: Arc<AppDb>,
    /// Table the entity persists to.
    spec: &'static TableSpec,
}

impl RowState {
    /// Binds a row to its database and table.
    #[must_use]
    pub fn new(db: &Arc<AppDb>, spec: &'static TableSpec) -> Self {
        Self {
            db: Arc::clone(db),
            spec,
        }
    }

    /// Returns the owning database.
    #[must_use]
    pub const fn db(&self) -> &Arc<AppDb> {
        &self.db
    }

    /// Returns the table specification.
    #[must_use]
    pub const fn spec(&self) -> &'static TableSpec {
        self.spec
    }

    /// Returns the dialect statements must be rendered in for `executor`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Usage`] when the executor belongs to a backend of
    /// another dialect than the owning database.
    pub fn dialect_for(&self, executor: &dyn Executor) -> Result<Dialect, DbError> {
        let dialect = self.db.dialect();
        if executor.dialect() != dialect {
            return Err(DbError::Usage(format!(
                "row of {} in database {} used with a {} executor",
                self.spec.name(),
                self.db.name(),
                executor.dialect()
            )));
        }
        Ok(dialect)
    }
}

impl std::fmt::Debug for RowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowState")
            .field("db", &self.db.name())
            .field("table", &self.spec.name())
            .finish()
    }
}

// ============================================================================
// SECTION: Row Contract
// ============================================================================

/// Capability set of a persisted entity.
pub trait Row {
    /// Returns the shared row state.
    fn state(&self) -> &RowState;

    /// Columns identifying an existing row for [`Row::exists`].
    fn lookup_columns(&self) -> &'static [&'static str];

    /// Returns the current value of each requested column, in order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] for a column the entity does not map.
    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError>;

    /// Overwrites fields from a fetched row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when a column is missing or mistyped.
    fn load(&mut self, row: &SqlRow) -> Result<(), DbError>;

    /// Records the identity assigned by the backend on insert.
    fn set_identity(&mut self, _id: i64) {}

    /// Looks the row up by its lookup columns and, when found, loads every
    /// column into `self`. Lookups over a `NULL` value never match.
    ///
    /// # Errors
    ///
    /// Propagates statement validation and execution failures.
    fn exists(&mut self, executor: &mut dyn Executor) -> Result<bool, DbError> {
        let spec = self.state().spec();
        let dialect = self.state().dialect_for(executor)?;
        let lookup = self.lookup_columns();
        let params = self.values(lookup)?;
        if params.iter().any(SqlValue::is_null) {
            return Ok(false);
        }
        let statement = select_statement(
            spec,
            dialect,
            &spec.column_names(),
            lookup,
            &SelectOptions::default().limit(1),
        )?;
        check_bindings(&statement, &params)?;
        match executor.query_opt(&statement.sql, &params)? {
            Some(row) => {
                self.load(&row)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Inserts every non-identity column, reading the identity back when the
    /// table declares one.
    ///
    /// # Errors
    ///
    /// Propagates statement validation and execution failures.
    fn insert(&mut self, executor: &mut dyn Executor) -> Result<(), DbError> {
        let spec = self.state().spec();
        let dialect = self.state().dialect_for(executor)?;
        let identity = spec.identity_column().map(|column| column.name.as_str());
        let columns: Vec<&str> = spec
            .columns()
            .iter()
            .filter(|column| !column.identity)
            .map(|column| column.name.as_str())
            .collect();
        let params = self.values(&columns)?;
        let statement = insert_statement(spec, dialect, &columns, identity)?;
        check_bindings(&statement, &params)?;
        if let Some(identity) = identity {
            let row = executor.query_opt(&statement.sql, &params)?.ok_or_else(|| {
                DbError::Decode(format!("insert into {} returned no identity", spec.name()))
            })?;
            self.set_identity(row.get_i64(identity)?);
        } else {
            executor.execute(&statement.sql, &params)?;
        }
        Ok(())
    }

    /// Updates every non-key column of the row matching the primary key and
    /// returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] when the table has no primary key or
    /// the key is unset; propagates execution failures.
    fn update(&self, executor: &mut dyn Executor) -> Result<u64, DbError> {
        let spec = self.state().spec();
        let dialect = self.state().dialect_for(executor)?;
        let keys = spec.primary_key();
        let columns: Vec<&str> = spec
            .columns()
            .iter()
            .filter(|column| !column.primary_key)
            .map(|column| column.name.as_str())
            .collect();
        let mut params = self.values(&columns)?;
        params.extend(key_values(self, spec, &keys)?);
        let statement = update_statement(spec, dialect, &columns, &keys)?;
        check_bindings(&statement, &params)?;
        executor.execute(&statement.sql, &params)
    }

    /// Deletes the row matching the primary key and returns the number of
    /// rows removed.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] when the table has no primary key or
    /// the key is unset; propagates execution failures.
    fn delete(&self, executor: &mut dyn Executor) -> Result<u64, DbError> {
        let spec = self.state().spec();
        let dialect = self.state().dialect_for(executor)?;
        let keys = spec.primary_key();
        let params = key_values(self, spec, &keys)?;
        let statement = delete_statement(spec, dialect, &keys)?;
        check_bindings(&statement, &params)?;
        executor.execute(&statement.sql, &params)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Runs a validated `SELECT` on `spec` and returns the raw rows.
///
/// # Errors
///
/// Returns [`DbError::Validation`] for unknown columns,
/// [`DbError::Usage`] when `params` does not match `matches`, and
/// propagates execution failures.
pub fn select_rows(
    executor: &mut dyn Executor,
    spec: &TableSpec,
    columns: &[&str],
    matches: &[&str],
    params: &[SqlValue],
    options: &SelectOptions,
) -> Result<Vec<SqlRow>, DbError> {
    let statement = select_statement(spec, executor.dialect(), columns, matches, options)?;
    check_bindings(&statement, params)?;
    executor.query(&statement.sql, params)
}

/// Error for a column an entity does not map.
#[must_use]
pub fn unknown_column(spec: &TableSpec, column: &str) -> DbError {
    DbError::Validation(format!("column {column} is not mapped by rows of {}", spec.name()))
}

/// Returns primary key values, rejecting tables without a key and unset keys.
fn key_values<R: Row + ?Sized>(
    row: &R,
    spec: &TableSpec,
    keys: &[&str],
) -> Result<Vec<SqlValue>, DbError> {
    if keys.is_empty() {
        return Err(DbError::Validation(format!("table {} has no primary key", spec.name())));
    }
    let values = row.values(keys)?;
    if values.iter().any(SqlValue::is_null) {
        return Err(DbError::Validation(format!(
            "row of {} has no primary key value",
            spec.name()
        )));
    }
    Ok(values)
}

/// Fails when the bound values do not match the statement's placeholders.
fn check_bindings(statement: &Statement, params: &[SqlValue]) -> Result<(), DbError> {
    if statement.bind_count != params.len() {
        return Err(DbError::Usage(format!(
            "statement binds {} values but {} were supplied",
            statement.bind_count,
            params.len()
        )));
    }
    Ok(())
}
