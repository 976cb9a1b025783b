// crates/telemetry-db/src/value.rs
// ============================================================================
// Module: SQL Values
// Description: Backend-neutral parameter values and decoded result rows.
// Purpose: Bind and read values uniformly across SQLite and Postgres.
// Dependencies: bytes, postgres, rusqlite, time
// ============================================================================

//! ## Overview
//! [`SqlValue`] is the only parameter type the engine binds. It implements
//! both `rusqlite::ToSql` and `postgres::types::ToSql`; the Postgres impl
//! narrows integers and timestamps to whatever type the server inferred for
//! the parameter. [`SqlRow`] holds decoded values by column name and its
//! typed getters absorb backend representation differences: `SQLite` stores
//! booleans as integers and timestamps as RFC 3339 text.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::error::Error as StdError;

use bytes::BytesMut;
use postgres::types::IsNull;
use postgres::types::ToSql;
use postgres::types::Type;
use postgres::types::to_sql_checked;
use rusqlite::types::ToSqlOutput;
use rusqlite::types::ValueRef;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::UtcOffset;
use time::format_description::well_known::Rfc3339;

use crate::error::DbError;

// ============================================================================
// SECTION: Values
// ============================================================================

/// A single bound or decoded SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit signed integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Boolean.
    Bool(bool),
    /// Raw bytes.
    Blob(Vec<u8>),
    /// Timestamp with offset; stored normalized to UTC.
    Timestamp(OffsetDateTime),
}

impl SqlValue {
    /// Returns true for SQL `NULL`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<OffsetDateTime> for SqlValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// Formats a timestamp as UTC RFC 3339 text.
///
/// # Errors
///
/// Returns [`DbError::Decode`] when the timestamp cannot be formatted.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, DbError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| DbError::Decode(format!("timestamp format failed: {err}")))
}

/// Parses RFC 3339 timestamp text.
///
/// # Errors
///
/// Returns [`DbError::Decode`] when the text is not RFC 3339.
pub fn parse_timestamp(text: &str) -> Result<OffsetDateTime, DbError> {
    OffsetDateTime::parse(text, &Rfc3339)
        .map_err(|err| DbError::Decode(format!("invalid timestamp \"{text}\": {err}")))
}

// ============================================================================
// SECTION: SQLite Binding
// ============================================================================

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Self::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Self::Integer(value) => ToSqlOutput::Borrowed(ValueRef::Integer(*value)),
            Self::Real(value) => ToSqlOutput::Borrowed(ValueRef::Real(*value)),
            Self::Text(value) => ToSqlOutput::Borrowed(ValueRef::Text(value.as_bytes())),
            Self::Bool(value) => ToSqlOutput::Borrowed(ValueRef::Integer(i64::from(*value))),
            Self::Blob(value) => ToSqlOutput::Borrowed(ValueRef::Blob(value)),
            Self::Timestamp(value) => {
                let text = format_timestamp(*value)
                    .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
                ToSqlOutput::from(text)
            }
        })
    }
}

/// Decodes one `SQLite` column value.
pub(crate) fn sqlite_value(value: ValueRef<'_>) -> Result<SqlValue, DbError> {
    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(value) => SqlValue::Integer(value),
        ValueRef::Real(value) => SqlValue::Real(value),
        ValueRef::Text(bytes) => SqlValue::Text(
            std::str::from_utf8(bytes)
                .map_err(|err| DbError::Decode(format!("invalid utf-8 text column: {err}")))?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    })
}

// ============================================================================
// SECTION: Postgres Binding
// ============================================================================

impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Integer(value) => {
                if *ty == Type::INT2 {
                    i16::try_from(*value)?.to_sql(ty, out)
                } else if *ty == Type::INT4 {
                    i32::try_from(*value)?.to_sql(ty, out)
                } else {
                    value.to_sql(ty, out)
                }
            }
            Self::Real(value) => value.to_sql(ty, out),
            Self::Text(value) => value.to_sql(ty, out),
            Self::Bool(value) => value.to_sql(ty, out),
            Self::Blob(value) => value.to_sql(ty, out),
            Self::Timestamp(value) => {
                let utc = value.to_offset(UtcOffset::UTC);
                if *ty == Type::TIMESTAMP {
                    PrimitiveDateTime::new(utc.date(), utc.time()).to_sql(ty, out)
                } else {
                    utc.to_sql(ty, out)
                }
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Decodes one Postgres column value based on its wire type.
pub(crate) fn postgres_value(row: &postgres::Row, index: usize) -> Result<SqlValue, DbError> {
    let ty = row.columns()[index].type_().clone();
    let decode = |err: postgres::Error| DbError::Decode(err.to_string());
    let value = if ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(index).map_err(decode)?.map(SqlValue::Bool)
    } else if ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(index)
            .map_err(decode)?
            .map(|value| SqlValue::Integer(i64::from(value)))
    } else if ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(index)
            .map_err(decode)?
            .map(|value| SqlValue::Integer(i64::from(value)))
    } else if ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(index).map_err(decode)?.map(SqlValue::Integer)
    } else if ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(index)
            .map_err(decode)?
            .map(|value| SqlValue::Real(f64::from(value)))
    } else if ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(index).map_err(decode)?.map(SqlValue::Real)
    } else if ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(index).map_err(decode)?.map(SqlValue::Blob)
    } else if ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<OffsetDateTime>>(index).map_err(decode)?.map(SqlValue::Timestamp)
    } else if ty == Type::TIMESTAMP {
        row.try_get::<_, Option<PrimitiveDateTime>>(index)
            .map_err(decode)?
            .map(|value| SqlValue::Timestamp(value.assume_utc()))
    } else {
        row.try_get::<_, Option<String>>(index).map_err(decode)?.map(SqlValue::Text)
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

// ============================================================================
// SECTION: Rows
// ============================================================================

/// A decoded result row addressed by column name.
///
/// # Invariants
/// - `columns` and `values` have equal length and matching order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlRow {
    /// Result column names.
    columns: Vec<String>,
    /// Result values.
    values: Vec<SqlValue>,
}

impl SqlRow {
    /// Builds a row from parallel column and value lists.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the lists differ in length.
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Result<Self, DbError> {
        if columns.len() != values.len() {
            return Err(DbError::Decode(format!(
                "row has {} columns but {} values",
                columns.len(),
                values.len()
            )));
        }
        Ok(Self {
            columns,
            values,
        })
    }

    /// Returns the result column names.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the raw value for a column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent from the row.
    pub fn get(&self, column: &str) -> Result<&SqlValue, DbError> {
        self.columns
            .iter()
            .position(|name| name == column)
            .map(|index| &self.values[index])
            .ok_or_else(|| DbError::Decode(format!("column {column} missing from result row")))
    }

    /// Returns an integer column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent, null, or not an integer.
    pub fn get_i64(&self, column: &str) -> Result<i64, DbError> {
        self.get_opt_i64(column)?.ok_or_else(|| null_column(column))
    }

    /// Returns a nullable integer column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent or not an integer.
    pub fn get_opt_i64(&self, column: &str) -> Result<Option<i64>, DbError> {
        match self.get(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(value) => Ok(Some(*value)),
            other => Err(type_mismatch(column, "integer", other)),
        }
    }

    /// Returns a text column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent, null, or not text.
    pub fn get_string(&self, column: &str) -> Result<String, DbError> {
        self.get_opt_string(column)?.ok_or_else(|| null_column(column))
    }

    /// Returns a nullable text column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent or not text.
    pub fn get_opt_string(&self, column: &str) -> Result<Option<String>, DbError> {
        match self.get(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(value) => Ok(Some(value.clone())),
            other => Err(type_mismatch(column, "text", other)),
        }
    }

    /// Returns a boolean column; integer `0`/`1` is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent, null, or not boolean.
    pub fn get_bool(&self, column: &str) -> Result<bool, DbError> {
        match self.get(column)? {
            SqlValue::Bool(value) => Ok(*value),
            SqlValue::Integer(0) => Ok(false),
            SqlValue::Integer(1) => Ok(true),
            SqlValue::Null => Err(null_column(column)),
            other => Err(type_mismatch(column, "boolean", other)),
        }
    }

    /// Returns a timestamp column.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent, null, or not a timestamp.
    pub fn get_timestamp(&self, column: &str) -> Result<OffsetDateTime, DbError> {
        self.get_opt_timestamp(column)?.ok_or_else(|| null_column(column))
    }

    /// Returns a nullable timestamp column; RFC 3339 text is accepted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent or not a timestamp.
    pub fn get_opt_timestamp(&self, column: &str) -> Result<Option<OffsetDateTime>, DbError> {
        match self.get(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Timestamp(value) => Ok(Some(*value)),
            SqlValue::Text(text) => parse_timestamp(text).map(Some),
            other => Err(type_mismatch(column, "timestamp", other)),
        }
    }

    /// Returns a blob column; text is accepted as its UTF-8 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Decode`] when the column is absent, null, or not bytes.
    pub fn get_blob(&self, column: &str) -> Result<Vec<u8>, DbError> {
        match self.get(column)? {
            SqlValue::Blob(value) => Ok(value.clone()),
            SqlValue::Text(value) => Ok(value.clone().into_bytes()),
            SqlValue::Null => Err(null_column(column)),
            other => Err(type_mismatch(column, "blob", other)),
        }
    }
}

/// Builds the error for an unexpected null.
fn null_column(column: &str) -> DbError {
    DbError::Decode(format!("column {column} is null"))
}

/// Builds the error for a value of the wrong type.
fn type_mismatch(column: &str, expected: &str, actual: &SqlValue) -> DbError {
    let actual = match actual {
        SqlValue::Null => "null",
        SqlValue::Integer(_) => "integer",
        SqlValue::Real(_) => "real",
        SqlValue::Text(_) => "text",
        SqlValue::Bool(_) => "boolean",
        SqlValue::Blob(_) => "blob",
        SqlValue::Timestamp(_) => "timestamp",
    };
    DbError::Decode(format!("column {column} expected {expected}, found {actual}"))
}
