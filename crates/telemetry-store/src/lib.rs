// crates/telemetry-store/src/lib.rs
// ============================================================================
// Module: Telemetry Store
// Description: Entities, logical databases, and the report staging queue.
// Purpose: Persist inbound reports and decompose them into telemetry rows.
// Dependencies: serde, serde_json, telemetry-db, thiserror, time, tracing
// ============================================================================

//! ## Overview
//! The store layer sits on top of `telemetry-db`:
//! - [`databases`] declares the Operational and Telemetry databases with
//!   their tables and migrations.
//! - [`entities`] maps clients, staged reports, customers, tag sets, and
//!   telemetry rows onto those tables.
//! - [`payload`] decodes the JSON report format.
//! - [`processor`] dispatches telemetry items to per-type processors.
//! - [`staging`] stages, claims, processes, and deletes reports.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod databases;
pub mod entities;
pub mod error;
pub mod payload;
pub mod processor;
pub mod staging;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use databases::OPERATIONAL;
pub use databases::TELEMETRY;
pub use databases::operational_db;
pub use databases::telemetry_db;
pub use entities::client::Client;
pub use entities::customer::Customer;
pub use entities::customer::UNKNOWN_CUSTOMER;
pub use entities::resolve_row;
pub use entities::staged_report::StagedReport;
pub use entities::tag_set::TagSet;
pub use entities::telemetry_data::TelemetryData;
pub use entities::telemetry_data::TelemetryDataFields;
pub use error::DrainError;
pub use error::DrainSummary;
pub use error::ReportFailure;
pub use error::StoreError;
pub use payload::ReportPayload;
pub use processor::DefaultProcessor;
pub use processor::ItemContext;
pub use processor::TelemetryProcessor;
pub use processor::TelemetryProcessorRegistry;
pub use staging::MAX_REPORT_BYTES;
pub use staging::StageOutcome;
pub use staging::StagingQueue;
