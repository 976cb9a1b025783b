// crates/telemetry-db/src/dialect.rs
// ============================================================================
// Module: SQL Dialects
// Description: Driver names, SQL dialects, and positional placeholder tokens.
// Purpose: Keep backend-specific SQL syntax behind one small surface.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A [`Driver`] names the physical backend a logical database is configured
//! with; several drivers share one [`Dialect`]. The dialect decides the
//! positional-parameter syntax produced by [`Placeholders`]: `?` for `SQLite`
//! and `$1, $2, ...` for Postgres.
//!
//! A [`Placeholders`] generator is sized up front for the number of values a
//! statement binds. Requesting a token beyond that count is a
//! [`DbError::Usage`] failure: the statement and its bound values disagree.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DbError;

// ============================================================================
// SECTION: Driver
// ============================================================================

/// Physical database driver selected by configuration.
///
/// # Invariants
/// - Serialized names are stable configuration values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Driver {
    /// `SQLite` database file.
    #[serde(rename = "sqlite3")]
    Sqlite,
    /// Single plain Postgres connection.
    #[serde(rename = "postgres")]
    Postgres,
    /// Pooled Postgres connections.
    #[serde(rename = "postgres-pool")]
    PooledPostgres,
}

impl Driver {
    /// Every supported driver.
    pub const ALL: [Self; 3] = [Self::Sqlite, Self::Postgres, Self::PooledPostgres];

    /// Returns the configuration name of the driver.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite3",
            Self::Postgres => "postgres",
            Self::PooledPostgres => "postgres-pool",
        }
    }

    /// Returns the SQL dialect spoken by the driver.
    #[must_use]
    pub const fn dialect(self) -> Dialect {
        match self {
            Self::Sqlite => Dialect::Sqlite,
            Self::Postgres | Self::PooledPostgres => Dialect::Postgres,
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Driver {
    type Err = DbError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|driver| driver.as_str() == value).ok_or_else(|| {
            DbError::Config(format!(
                "unsupported driver \"{value}\"; expected one of sqlite3, postgres, postgres-pool"
            ))
        })
    }
}

// ============================================================================
// SECTION: Dialect
// ============================================================================

/// SQL dialect family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// `SQLite` syntax.
    Sqlite,
    /// Postgres syntax.
    Postgres,
}

impl Dialect {
    /// Returns a placeholder generator sized for `count` bound values.
    #[must_use]
    pub const fn placeholders(self, count: usize) -> Placeholders {
        Placeholders::new(self, count)
    }

    /// Returns true when the dialect supports advisory locks.
    #[must_use]
    pub const fn supports_advisory_locks(self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Returns the dialect name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// SECTION: Placeholders
// ============================================================================

/// Stateful generator of positional parameter tokens.
///
/// # Invariants
/// - Yields exactly `count` tokens, in order, then reports exhaustion.
/// - Postgres tokens are numbered from `$1`; `SQLite` tokens are all `?`.
#[derive(Debug, Clone)]
pub struct Placeholders {
    /// Dialect controlling token syntax.
    dialect: Dialect,
    /// Number of tokens the generator may produce.
    count: usize,
    /// Number of tokens produced so far.
    issued: usize,
}

impl Placeholders {
    /// Creates a generator for `count` tokens.
    #[must_use]
    pub const fn new(dialect: Dialect, count: usize) -> Self {
        Self {
            dialect,
            count,
            issued: 0,
        }
    }

    /// Returns the number of tokens not yet issued.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.count - self.issued
    }

    /// Returns the next token.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Usage`] when every declared token was already issued.
    pub fn next_token(&mut self) -> Result<String, DbError> {
        self.next().ok_or_else(|| {
            DbError::Usage(format!("placeholder generator exhausted after {} tokens", self.count))
        })
    }
}

impl Iterator for Placeholders {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.issued >= self.count {
            return None;
        }
        self.issued += 1;
        Some(match self.dialect {
            Dialect::Sqlite => "?".to_string(),
            Dialect::Postgres => format!("${}", self.issued),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

impl ExactSizeIterator for Placeholders {}

#[cfg(test)]
mod tests {
    #![allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::use_debug,
        clippy::panic,
        reason = "Test-only assertions and helpers are permitted."
    )]

    use super::Dialect;
    use super::Driver;

    #[test]
    fn driver_names_round_trip() {
        for driver in Driver::ALL {
            assert_eq!(driver.as_str().parse::<Driver>().expect("parse"), driver);
        }
        assert!("mysql".parse::<Driver>().is_err());
    }

    #[test]
    fn postgres_family_shares_dialect() {
        assert_eq!(Driver::Postgres.dialect(), Dialect::Postgres);
        assert_eq!(Driver::PooledPostgres.dialect(), Dialect::Postgres);
        assert_eq!(Driver::Sqlite.dialect(), Dialect::Sqlite);
    }

    #[test]
    fn zero_count_generator_is_immediately_exhausted() {
        let mut tokens = Dialect::Postgres.placeholders(0);
        assert_eq!(tokens.remaining(), 0);
        assert!(tokens.next_token().is_err_and(|err| err.is_usage()));
    }
}
