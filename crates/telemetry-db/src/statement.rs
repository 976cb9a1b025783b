// crates/telemetry-db/src/statement.rs
// ============================================================================
// Module: Statement Builder
// Description: Dialect-aware SELECT/INSERT/UPDATE/DELETE synthesis.
// Purpose: Emit parameterized SQL only after validating every column name.
// Dependencies: crate::dialect, crate::table
// ============================================================================

//! ## Overview
//! Each builder validates its column lists against the owning [`TableSpec`]
//! before assembling any text, so an invalid request never yields a partial
//! statement. Predicates are a plain conjunction of `"column" = <token>`
//! terms; there is no `OR`, nesting, or expression support. Values are never
//! interpolated: every value position is a placeholder drawn from a
//! generator sized to exactly the number of values the caller binds.
//!
//! Matching a `NULL` value through `=` never matches; callers filter nullable
//! columns by non-null values only.

// ============================================================================
// SECTION: Imports
// ============================================================================

use crate::dialect::Dialect;
use crate::dialect::Placeholders;
use crate::error::DbError;
use crate::table::TableSpec;
use crate::table::quote_identifier;

// ============================================================================
// SECTION: Statement
// ============================================================================

/// A rendered statement and the number of values it binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Parameterized SQL text.
    pub sql: String,
    /// Number of placeholders in `sql`.
    pub bind_count: usize,
}

/// Options for [`select_statement`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectOptions {
    /// Emit `SELECT DISTINCT`.
    pub distinct: bool,
    /// Return a single `count` column instead of the selected columns.
    pub count: bool,
    /// Maximum rows to return.
    pub limit: Option<u64>,
    /// Columns to order by.
    pub order_by: Vec<String>,
    /// Order descending instead of ascending.
    pub descending: bool,
    /// Lock selected rows for the enclosing transaction, skipping rows
    /// already locked by others. Only Postgres emits a clause.
    pub for_update: bool,
}

impl SelectOptions {
    /// Sets a row limit.
    #[must_use]
    pub const fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Orders by a column.
    #[must_use]
    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by.push(column.to_string());
        self
    }

    /// Orders descending.
    #[must_use]
    pub const fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Counts rows instead of returning them.
    #[must_use]
    pub const fn count(mut self) -> Self {
        self.count = true;
        self
    }

    /// Selects distinct values.
    #[must_use]
    pub const fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Locks the selected rows.
    #[must_use]
    pub const fn for_update(mut self) -> Self {
        self.for_update = true;
        self
    }
}

// ============================================================================
// SECTION: Builders
// ============================================================================

/// Renders a `SELECT` over `columns` filtered by equality on `matches`.
///
/// # Errors
///
/// Returns [`DbError::Validation`] when a column is unknown or the options
/// are inconsistent.
pub fn select_statement(
    spec: &TableSpec,
    dialect: Dialect,
    columns: &[&str],
    matches: &[&str],
    options: &SelectOptions,
) -> Result<Statement, DbError> {
    spec.check_column_names(columns)?;
    spec.check_column_names(matches)?;
    spec.check_column_names(&options.order_by)?;
    if columns.is_empty() && !options.count {
        return Err(DbError::Validation(format!(
            "select on {} requires at least one column",
            spec.name()
        )));
    }
    let projection = if options.count {
        if options.distinct {
            let [column] = columns else {
                return Err(DbError::Validation(format!(
                    "distinct count on {} requires exactly one column",
                    spec.name()
                )));
            };
            format!("COUNT(DISTINCT {}) AS \"count\"", quote_identifier(column))
        } else {
            "COUNT(*) AS \"count\"".to_string()
        }
    } else {
        let list = quoted_list(columns);
        if options.distinct { format!("DISTINCT {list}") } else { list }
    };
    let mut placeholders = dialect.placeholders(matches.len());
    let mut sql = format!("SELECT {projection} FROM {}", quote_identifier(spec.name()));
    push_where(&mut sql, matches, &mut placeholders)?;
    if !options.order_by.is_empty() {
        let direction = if options.descending { "DESC" } else { "ASC" };
        let terms: Vec<String> = options
            .order_by
            .iter()
            .map(|column| format!("{} {direction}", quote_identifier(column)))
            .collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
    }
    if let Some(limit) = options.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if options.for_update && dialect == Dialect::Postgres {
        sql.push_str(" FOR UPDATE SKIP LOCKED");
    }
    Ok(Statement {
        sql,
        bind_count: matches.len(),
    })
}

/// Renders an `INSERT` binding one value per column, optionally returning a
/// column (typically the identity key).
///
/// # Errors
///
/// Returns [`DbError::Validation`] when a column is unknown or none are given.
pub fn insert_statement(
    spec: &TableSpec,
    dialect: Dialect,
    columns: &[&str],
    returning: Option<&str>,
) -> Result<Statement, DbError> {
    spec.check_column_names(columns)?;
    if let Some(column) = returning {
        spec.check_column_names(&[column])?;
    }
    if columns.is_empty() {
        return Err(DbError::Validation(format!(
            "insert into {} requires at least one column",
            spec.name()
        )));
    }
    let mut placeholders = dialect.placeholders(columns.len());
    let mut tokens = Vec::with_capacity(columns.len());
    for _ in columns {
        tokens.push(placeholders.next_token()?);
    }
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(spec.name()),
        quoted_list(columns),
        tokens.join(", ")
    );
    if let Some(column) = returning {
        sql.push_str(" RETURNING ");
        sql.push_str(&quote_identifier(column));
    }
    Ok(Statement {
        sql,
        bind_count: columns.len(),
    })
}

/// Renders an `UPDATE` setting `columns` where every `matches` column is equal
/// to its bound value. Values bind in `columns` then `matches` order.
///
/// # Errors
///
/// Returns [`DbError::Validation`] when a column is unknown or either list is
/// empty.
pub fn update_statement(
    spec: &TableSpec,
    dialect: Dialect,
    columns: &[&str],
    matches: &[&str],
) -> Result<Statement, DbError> {
    spec.check_column_names(columns)?;
    spec.check_column_names(matches)?;
    if columns.is_empty() || matches.is_empty() {
        return Err(DbError::Validation(format!(
            "update of {} requires set and match columns",
            spec.name()
        )));
    }
    let bind_count = columns.len() + matches.len();
    let mut placeholders = dialect.placeholders(bind_count);
    let mut assignments = Vec::with_capacity(columns.len());
    for column in columns {
        assignments.push(format!("{} = {}", quote_identifier(column), placeholders.next_token()?));
    }
    let mut sql =
        format!("UPDATE {} SET {}", quote_identifier(spec.name()), assignments.join(", "));
    push_where(&mut sql, matches, &mut placeholders)?;
    Ok(Statement {
        sql,
        bind_count,
    })
}

/// Renders a `DELETE` where every `matches` column equals its bound value.
///
/// # Errors
///
/// Returns [`DbError::Validation`] when a column is unknown or no match
/// columns are given.
pub fn delete_statement(
    spec: &TableSpec,
    dialect: Dialect,
    matches: &[&str],
) -> Result<Statement, DbError> {
    spec.check_column_names(matches)?;
    if matches.is_empty() {
        return Err(DbError::Validation(format!(
            "delete from {} requires match columns",
            spec.name()
        )));
    }
    let mut placeholders = dialect.placeholders(matches.len());
    let mut sql = format!("DELETE FROM {}", quote_identifier(spec.name()));
    push_where(&mut sql, matches, &mut placeholders)?;
    Ok(Statement {
        sql,
        bind_count: matches.len(),
    })
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Joins quoted column names with commas.
fn quoted_list(columns: &[&str]) -> String {
    columns.iter().map(|column| quote_identifier(column)).collect::<Vec<_>>().join(", ")
}

/// Appends a `WHERE` conjunction over `matches`, if any.
fn push_where(
    sql: &mut String,
    matches: &[&str],
    placeholders: &mut Placeholders,
) -> Result<(), DbError> {
    if matches.is_empty() {
        return Ok(());
    }
    let mut terms = Vec::with_capacity(matches.len());
    for column in matches {
        terms.push(format!("{} = {}", quote_identifier(column), placeholders.next_token()?));
    }
    sql.push_str(" WHERE ");
    sql.push_str(&terms.join(" AND "));
    Ok(())
}
