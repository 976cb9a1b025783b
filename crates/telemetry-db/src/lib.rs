// crates/telemetry-db/src/lib.rs
// ============================================================================
// Module: Telemetry DB
// Description: Dialect-aware SQL engine for the telemetry ingest service.
// Purpose: Table specs, statements, backends, convergence, and migrations.
// Dependencies: postgres, r2d2, r2d2_postgres, rusqlite, time, tracing
// ============================================================================

//! ## Overview
//! This crate is the storage core of the ingest service. It runs identically
//! on `SQLite`, a single Postgres connection, or a pooled Postgres backend:
//! - [`TableSpec`] declares a table and renders its DDL.
//! - The statement builders emit parameterized `SELECT`/`INSERT`/`UPDATE`/
//!   `DELETE` text validated against a spec, with dialect placeholders.
//! - [`ConnectionManager`] owns one backend and its advisory locks.
//! - [`create_table_from_spec`] converges tables safely under concurrent
//!   start-up; [`perform_db_migration`] applies forward migrations.
//! - [`Row`] gives persisted entities exists/insert/update/delete.
//! - [`AppDb`] ties a named backend, its tables, and its migrations together.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod app_db;
pub mod backend;
pub mod convergence;
pub mod dialect;
pub mod error;
pub mod executor;
pub mod migration;
pub mod row;
pub mod statement;
pub mod table;
pub mod value;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use app_db::AppDb;
pub use backend::CREATE_TABLE_LOCK_ID;
pub use backend::ConnectionManager;
pub use backend::DatabaseConfig;
pub use backend::LockMode;
pub use backend::LockRequest;
pub use backend::LockScope;
pub use backend::PoolLimits;
pub use convergence::create_table_from_spec;
pub use convergence::table_exists;
pub use dialect::Dialect;
pub use dialect::Driver;
pub use dialect::Placeholders;
pub use error::DbError;
pub use executor::Executor;
pub use executor::RawConnection;
pub use executor::Session;
pub use executor::Transaction;
pub use migration::DbVersion;
pub use migration::Migration;
pub use migration::MigrationOutcome;
pub use migration::MigrationSet;
pub use migration::perform_db_migration;
pub use row::Row;
pub use row::RowState;
pub use row::select_rows;
pub use row::unknown_column;
pub use statement::SelectOptions;
pub use statement::Statement;
pub use statement::delete_statement;
pub use statement::insert_statement;
pub use statement::select_statement;
pub use statement::update_statement;
pub use table::Column;
pub use table::SqlType;
pub use table::TableSpec;
pub use value::SqlRow;
pub use value::SqlValue;
