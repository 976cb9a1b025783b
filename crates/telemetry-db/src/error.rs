// crates/telemetry-db/src/error.rs
// ============================================================================
// Module: Database Errors
// Description: Error taxonomy shared by every layer of the SQL engine.
// Purpose: Separate validation, I/O, and programming-error failures.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! [`DbError`] is the single error type returned by the engine. Variants map
//! onto the failure classes callers handle differently:
//! - validation failures ([`DbError::Validation`], [`DbError::Config`]) are
//!   raised before any I/O is attempted;
//! - transient I/O failures ([`DbError::Connect`], [`DbError::Exec`],
//!   [`DbError::Lock`], [`DbError::Closed`]) are logged where they occur and
//!   returned unchanged, the engine never retries;
//! - [`DbError::Usage`] marks a defect in the calling code rather than an
//!   environmental condition and should never be handled as recoverable.
//!
//! Messages carry identifiers and backend diagnostics only, never bound
//! parameter values.

use thiserror::Error;

/// Errors produced by the SQL engine.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
/// - Messages never embed bound parameter values or report payloads.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// A statement or table specification referenced something invalid.
    #[error("validation error: {0}")]
    Validation(String),
    /// Database configuration is invalid.
    #[error("invalid database configuration: {0}")]
    Config(String),
    /// Opening or pinging the backend failed.
    #[error("database connection error: {0}")]
    Connect(String),
    /// The connection manager has been closed or was never connected.
    #[error("database connection closed: {0}")]
    Closed(String),
    /// Statement execution, transaction control, or commit failed.
    #[error("database execution error: {0}")]
    Exec(String),
    /// A result row could not be decoded into the requested type.
    #[error("database decode error: {0}")]
    Decode(String),
    /// Advisory lock acquisition or release failed.
    #[error("database lock error: {0}")]
    Lock(String),
    /// Migration bookkeeping is inconsistent with the registered migrations.
    #[error("database migration error: {0}")]
    Migration(String),
    /// The engine was used incorrectly by the calling code.
    #[error("database usage error: {0}")]
    Usage(String),
}

impl DbError {
    /// Returns true when the error indicates a defect in the calling code.
    #[must_use]
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Exec(error.to_string())
    }
}

impl From<postgres::Error> for DbError {
    fn from(error: postgres::Error) -> Self {
        Self::Exec(postgres_error_text(&error))
    }
}

/// Renders a Postgres client error with the server diagnostics it carries.
///
/// The client's own `Display` collapses server-side failures to "db error".
/// The detail field is left out because it echoes key values.
pub(crate) fn postgres_error_text(error: &postgres::Error) -> String {
    error.as_db_error().map_or_else(
        || error.to_string(),
        |server| {
            server_error_text(
                server.code().code(),
                server.message(),
                server.table(),
                server.constraint(),
            )
        },
    )
}

/// Formats server diagnostics as `message (SQLSTATE code) [table t, constraint c]`.
fn server_error_text(
    code: &str,
    message: &str,
    table: Option<&str>,
    constraint: Option<&str>,
) -> String {
    let mut text = format!("{message} (SQLSTATE {code})");
    let context: Vec<String> = [("table", table), ("constraint", constraint)]
        .into_iter()
        .filter_map(|(label, value)| value.map(|value| format!("{label} {value}")))
        .collect();
    if !context.is_empty() {
        text.push_str(" [");
        text.push_str(&context.join(", "));
        text.push(']');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::server_error_text;

    #[test]
    fn server_errors_keep_code_and_constraint() {
        let text = server_error_text(
            "23505",
            "duplicate key value violates unique constraint \"reports_key\"",
            Some("reports"),
            Some("reports_key"),
        );
        assert_eq!(
            text,
            "duplicate key value violates unique constraint \"reports_key\" (SQLSTATE 23505) \
             [table reports, constraint reports_key]"
        );
    }

    #[test]
    fn server_errors_without_context_stay_short() {
        assert_eq!(
            server_error_text("42P01", "relation \"reports\" does not exist", None, None),
            "relation \"reports\" does not exist (SQLSTATE 42P01)"
        );
    }
}
