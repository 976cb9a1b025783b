// crates/telemetry-db/src/table.rs
// ============================================================================
// Module: Table Specifications
// Description: Declarative column, key, and constraint model plus DDL output.
// Purpose: Validate every column reference before SQL is assembled.
// Dependencies: crate::dialect, crate::error
// ============================================================================

//! ## Overview
//! A [`TableSpec`] is built once at start-up and shared read-only by every
//! row of the table. Construction goes through [`TableSpecBuilder`], which
//! rejects malformed identifiers, duplicate columns, more than one identity
//! column, and foreign keys over undeclared columns. Identifiers are emitted
//! double-quoted so mixed-case names survive Postgres case folding.
//!
//! [`TableSpec::create_cmd`] renders `CREATE TABLE IF NOT EXISTS` for a
//! dialect. Identity columns render as `BIGINT GENERATED BY DEFAULT AS
//! IDENTITY` on Postgres and as an `INTEGER PRIMARY KEY` rowid alias on
//! `SQLite`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashSet;

use crate::dialect::Dialect;
use crate::error::DbError;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum identifier length accepted for tables and columns.
const MAX_IDENTIFIER_LENGTH: usize = 63;

// ============================================================================
// SECTION: Columns
// ============================================================================

/// Logical SQL column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    /// 64-bit integer.
    Integer,
    /// Double precision float.
    Real,
    /// Unbounded text.
    Text,
    /// Boolean.
    Boolean,
    /// Raw bytes.
    Blob,
    /// Timestamp with time zone.
    Timestamp,
}

impl SqlType {
    /// Returns the column type keyword for a dialect.
    #[must_use]
    pub const fn render(self, dialect: Dialect) -> &'static str {
        match (self, dialect) {
            (Self::Integer, Dialect::Sqlite) => "INTEGER",
            (Self::Integer, Dialect::Postgres) => "BIGINT",
            (Self::Real, Dialect::Sqlite) => "REAL",
            (Self::Real, Dialect::Postgres) => "DOUBLE PRECISION",
            (Self::Text | Self::Timestamp, Dialect::Sqlite) => "TEXT",
            (Self::Text, Dialect::Postgres) => "TEXT",
            (Self::Boolean, _) => "BOOLEAN",
            (Self::Blob, Dialect::Sqlite) => "BLOB",
            (Self::Blob, Dialect::Postgres) => "BYTEA",
            (Self::Timestamp, Dialect::Postgres) => "TIMESTAMPTZ",
        }
    }
}

/// A single column declaration.
///
/// # Invariants
/// - `name` is a validated identifier once accepted by [`TableSpecBuilder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Column type.
    pub sql_type: SqlType,
    /// Whether `NULL` is permitted.
    pub nullable: bool,
    /// Default value literal, emitted verbatim.
    pub default: Option<String>,
    /// Whether the column is the primary key.
    pub primary_key: bool,
    /// Whether the backend assigns values automatically.
    pub identity: bool,
    /// Whether values must be unique.
    pub unique: bool,
}

impl Column {
    /// Creates a non-null column with no constraints.
    #[must_use]
    pub fn new(name: &str, sql_type: SqlType) -> Self {
        Self {
            name: name.to_string(),
            sql_type,
            nullable: false,
            default: None,
            primary_key: false,
            identity: false,
            unique: false,
        }
    }

    /// Creates the conventional auto-assigned integer primary key.
    #[must_use]
    pub fn identity(name: &str) -> Self {
        Self {
            primary_key: true,
            identity: true,
            ..Self::new(name, SqlType::Integer)
        }
    }

    /// Marks the column nullable.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the column unique.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the column as the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Sets a default literal such as `false` or `CURRENT_TIMESTAMP`.
    #[must_use]
    pub fn default_literal(mut self, literal: &str) -> Self {
        self.default = Some(literal.to_string());
        self
    }

    /// Renders the column definition for a dialect.
    #[must_use]
    pub fn render(&self, dialect: Dialect) -> String {
        let mut out = quote_identifier(&self.name);
        if self.identity {
            match dialect {
                Dialect::Sqlite => out.push_str(" INTEGER PRIMARY KEY"),
                Dialect::Postgres => {
                    out.push_str(" BIGINT GENERATED BY DEFAULT AS IDENTITY PRIMARY KEY");
                }
            }
            return out;
        }
        out.push(' ');
        out.push_str(self.sql_type.render(dialect));
        if !self.nullable {
            out.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            out.push_str(" DEFAULT ");
            out.push_str(default);
        }
        if self.primary_key {
            out.push_str(" PRIMARY KEY");
        }
        if self.unique {
            out.push_str(" UNIQUE");
        }
        out
    }
}

/// A single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing column in this table.
    pub column: String,
    /// Referenced table.
    pub references_table: String,
    /// Referenced column.
    pub references_column: String,
}

impl ForeignKey {
    /// Renders the `FOREIGN KEY` clause.
    #[must_use]
    pub fn render(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {}({})",
            quote_identifier(&self.column),
            quote_identifier(&self.references_table),
            quote_identifier(&self.references_column)
        )
    }
}

// ============================================================================
// SECTION: Table Specification
// ============================================================================

/// Immutable description of one table.
///
/// # Invariants
/// - Column names are unique and valid identifiers.
/// - At most one column is an identity column.
/// - Every foreign key references a declared column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// Table name.
    name: String,
    /// Ordered columns.
    columns: Vec<Column>,
    /// Foreign keys.
    foreign_keys: Vec<ForeignKey>,
    /// Raw trailing DDL fragments, such as composite `UNIQUE` constraints.
    extras: Vec<String>,
}

impl TableSpec {
    /// Starts building a table specification.
    #[must_use]
    pub fn builder(name: &str) -> TableSpecBuilder {
        TableSpecBuilder {
            name: name.to_string(),
            columns: Vec::new(),
            foreign_keys: Vec::new(),
            extras: Vec::new(),
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the ordered columns.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Returns the foreign keys.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Returns a column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Returns every column name in declaration order.
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    /// Returns the identity column, when one is declared.
    #[must_use]
    pub fn identity_column(&self) -> Option<&Column> {
        self.columns.iter().find(|column| column.identity)
    }

    /// Returns the primary key column names.
    #[must_use]
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|column| column.primary_key)
            .map(|column| column.name.as_str())
            .collect()
    }

    /// Checks that every name is a declared column (case-sensitive).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] naming the first unknown column.
    pub fn check_column_names<S: AsRef<str>>(&self, names: &[S]) -> Result<(), DbError> {
        for name in names {
            let name = name.as_ref();
            if self.column(name).is_none() {
                return Err(DbError::Validation(format!(
                    "column \"{name}\" is not defined in table {}",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Renders `CREATE TABLE IF NOT EXISTS` for a dialect.
    #[must_use]
    pub fn create_cmd(&self, dialect: Dialect) -> String {
        let parts: Vec<String> = self
            .columns
            .iter()
            .map(|column| column.render(dialect))
            .chain(self.foreign_keys.iter().map(ForeignKey::render))
            .chain(self.extras.iter().cloned())
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_identifier(&self.name),
            parts.join(", ")
        )
    }
}

/// Builder validating a [`TableSpec`].
#[derive(Debug, Clone)]
pub struct TableSpecBuilder {
    /// Table name.
    name: String,
    /// Columns collected so far.
    columns: Vec<Column>,
    /// Foreign keys collected so far.
    foreign_keys: Vec<ForeignKey>,
    /// Raw DDL fragments collected so far.
    extras: Vec<String>,
}

impl TableSpecBuilder {
    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Appends a foreign key `column -> table(referenced)`.
    #[must_use]
    pub fn foreign_key(mut self, column: &str, table: &str, referenced: &str) -> Self {
        self.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            references_table: table.to_string(),
            references_column: referenced.to_string(),
        });
        self
    }

    /// Appends a raw DDL fragment emitted after columns and foreign keys.
    #[must_use]
    pub fn extra(mut self, fragment: &str) -> Self {
        self.extras.push(fragment.to_string());
        self
    }

    /// Validates and returns the specification.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] when the specification is malformed.
    pub fn build(self) -> Result<TableSpec, DbError> {
        validate_identifier(&self.name)?;
        if self.columns.is_empty() {
            return Err(DbError::Validation(format!("table {} declares no columns", self.name)));
        }
        let mut seen = HashSet::new();
        for column in &self.columns {
            validate_identifier(&column.name)?;
            if !seen.insert(column.name.as_str()) {
                return Err(DbError::Validation(format!(
                    "table {} declares column {} twice",
                    self.name, column.name
                )));
            }
        }
        if self.columns.iter().filter(|column| column.identity).count() > 1 {
            return Err(DbError::Validation(format!(
                "table {} declares more than one identity column",
                self.name
            )));
        }
        let spec = TableSpec {
            name: self.name,
            columns: self.columns,
            foreign_keys: Vec::new(),
            extras: self.extras,
        };
        for foreign_key in &self.foreign_keys {
            spec.check_column_names(&[foreign_key.column.as_str()]).map_err(|_| {
                DbError::Validation(format!(
                    "foreign key references unknown column {} in table {}",
                    foreign_key.column, spec.name
                ))
            })?;
            validate_identifier(&foreign_key.references_table)?;
            validate_identifier(&foreign_key.references_column)?;
        }
        Ok(TableSpec {
            foreign_keys: self.foreign_keys,
            ..spec
        })
    }
}

// ============================================================================
// SECTION: Identifiers
// ============================================================================

/// Validates a table or column identifier.
///
/// # Errors
///
/// Returns [`DbError::Validation`] unless the identifier matches
/// `[A-Za-z_][A-Za-z0-9_]*` and fits the length limit.
pub fn validate_identifier(identifier: &str) -> Result<(), DbError> {
    let mut chars = identifier.chars();
    let valid_start = chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let valid_rest = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if !valid_start || !valid_rest || identifier.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DbError::Validation(format!("invalid identifier \"{identifier}\"")));
    }
    Ok(())
}

/// Double-quotes a validated identifier.
#[must_use]
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::use_debug,
        clippy::panic,
        reason = "Test-only assertions and helpers are permitted."
    )]

    use super::Column;
    use super::SqlType;
    use super::TableSpec;
    use crate::dialect::Dialect;

    fn customers() -> TableSpec {
        TableSpec::builder("customers")
            .column(Column::identity("id"))
            .column(Column::new("customerId", SqlType::Text).unique())
            .build()
            .expect("spec")
    }

    #[test]
    fn identity_columns_render_per_dialect() {
        let spec = customers();
        assert_eq!(
            spec.create_cmd(Dialect::Postgres),
            "CREATE TABLE IF NOT EXISTS \"customers\" (\"id\" BIGINT GENERATED BY DEFAULT AS \
             IDENTITY PRIMARY KEY, \"customerId\" TEXT NOT NULL UNIQUE)"
        );
        assert_eq!(
            spec.create_cmd(Dialect::Sqlite),
            "CREATE TABLE IF NOT EXISTS \"customers\" (\"id\" INTEGER PRIMARY KEY, \
             \"customerId\" TEXT NOT NULL UNIQUE)"
        );
    }

    #[test]
    fn duplicate_columns_are_rejected() {
        let result = TableSpec::builder("t")
            .column(Column::new("a", SqlType::Text))
            .column(Column::new("a", SqlType::Integer))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn foreign_keys_require_declared_columns() {
        let result = TableSpec::builder("t")
            .column(Column::identity("id"))
            .foreign_key("customerId", "customers", "id")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert!(TableSpec::builder("bad name").column(Column::identity("id")).build().is_err());
        assert!(TableSpec::builder("t").column(Column::identity("id\"; --")).build().is_err());
    }
}
