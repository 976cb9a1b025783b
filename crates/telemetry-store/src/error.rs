// crates/telemetry-store/src/error.rs
// ============================================================================
// Module: Store Errors
// Description: Failures of entity persistence, payload decoding, and drains.
// Purpose: Keep per-report failures distinct from storage failures.
// Dependencies: telemetry-db, thiserror
// ============================================================================

//! ## Overview
//! [`StoreError`] covers one operation. A drain runs many, so it collects a
//! [`ReportFailure`] per failed report and returns them together in a
//! [`DrainError`] alongside the [`DrainSummary`] of what succeeded.

use telemetry_db::DbError;
use thiserror::Error;

/// Errors produced by the store layer.
///
/// # Invariants
/// - Messages never embed report payload contents.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Storage engine failure.
    #[error(transparent)]
    Db(#[from] DbError),
    /// Caller input rejected before any I/O.
    #[error("invalid input: {0}")]
    Validation(String),
    /// Report payload could not be decoded or is inconsistent.
    #[error("invalid report payload: {0}")]
    Payload(String),
    /// A telemetry processor rejected an item.
    #[error("telemetry processing failed: {0}")]
    Processor(String),
    /// Processor registry is misconfigured.
    #[error("processor registry error: {0}")]
    Registry(String),
}

/// One staged report that failed to drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportFailure {
    /// Staging row id, when the report was claimed.
    pub staged_id: Option<i64>,
    /// Report identifier, when known.
    pub report_id: Option<String>,
    /// Failure description.
    pub error: String,
}

impl std::fmt::Display for ReportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.report_id {
            Some(report_id) => write!(f, "report {report_id}: {}", self.error),
            None => write!(f, "claim: {}", self.error),
        }
    }
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    /// Reports processed and deleted.
    pub processed: usize,
    /// Reports that failed and remain claimed.
    pub failed: usize,
}

impl DrainSummary {
    /// Adds another pass's counts.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            processed: self.processed + other.processed,
            failed: self.failed + other.failed,
        }
    }
}

/// Aggregate of every isolated failure from one drain pass.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{} report(s) failed during drain: {}", .failures.len(), join_failures(.failures))]
pub struct DrainError {
    /// Counts for the pass, including successes.
    pub summary: DrainSummary,
    /// Individual failures, in claim order.
    pub failures: Vec<ReportFailure>,
}

/// Joins failures into one line.
fn join_failures(failures: &[ReportFailure]) -> String {
    failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}
