// crates/telemetry-store/src/staging.rs
// ============================================================================
// Module: Staging Queue
// Description: Durable claim/process/delete pipeline for inbound reports.
// Purpose: Turn at-least-once report delivery into idempotent processing.
// Dependencies: telemetry-db, time, tracing
// ============================================================================

//! ## Overview
//! Reports are staged in the Operational database and drained into the
//! Telemetry database by any number of competing workers:
//! - [`StagingQueue::stage`] inserts an unallocated row; re-staging the same
//!   `(clientId, reportId)` is reported as a duplicate and stores nothing.
//! - [`StagingQueue::claim_next`] claims the oldest unallocated row in one
//!   transaction. On Postgres the select skips rows locked by concurrent
//!   claimers; on `SQLite` the transaction holds the write lock. The update
//!   is guarded by `allocated = false` in both cases.
//! - [`StagingQueue::drain`] processes claimed reports until none remain.
//!   One report's failure is recorded and the drain moves on; the failed
//!   row stays claimed for an operator to inspect.
//!
//! Claimed rows are never re-claimed automatically. A worker that dies
//! between claim and delete leaves a row that [`StagingQueue::stale_claims`]
//! reports once its `allocatedAt` is old enough.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use telemetry_db::AppDb;
use telemetry_db::DbError;
use telemetry_db::Row;
use telemetry_db::SelectOptions;
use telemetry_db::SqlValue;
use telemetry_db::select_rows;
use time::OffsetDateTime;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::entities::client::Client;
use crate::entities::customer::Customer;
use crate::entities::customer::UNKNOWN_CUSTOMER;
use crate::entities::staged_report::StagedReport;
use crate::entities::staged_report::reports_spec;
use crate::entities::tag_set::TagSet;
use crate::error::DrainError;
use crate::error::DrainSummary;
use crate::error::ReportFailure;
use crate::error::StoreError;
use crate::payload::ReportPayload;
use crate::processor::ItemContext;
use crate::processor::TelemetryProcessorRegistry;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum staged payload size in bytes.
pub const MAX_REPORT_BYTES: usize = 8 * 1024 * 1024;
/// Maximum client or report identifier length.
pub const MAX_IDENTIFIER_BYTES: usize = 256;

// ============================================================================
// SECTION: Queue
// ============================================================================

/// Result of staging a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// The report was stored.
    Staged {
        /// Staging row id.
        id: i64,
    },
    /// The report was already staged and is left untouched.
    Duplicate {
        /// Existing staging row id.
        id: i64,
    },
}

/// Staging queue over the Operational and Telemetry databases.
#[derive(Debug, Clone)]
pub struct StagingQueue {
    /// Database holding clients and staged reports.
    operational: Arc<AppDb>,
    /// Database receiving decoded telemetry.
    telemetry: Arc<AppDb>,
    /// Processor dispatch.
    registry: Arc<TelemetryProcessorRegistry>,
}

impl StagingQueue {
    /// Creates a queue over initialized databases.
    #[must_use]
    pub const fn new(
        operational: Arc<AppDb>,
        telemetry: Arc<AppDb>,
        registry: Arc<TelemetryProcessorRegistry>,
    ) -> Self {
        Self {
            operational,
            telemetry,
            registry,
        }
    }

    /// Returns the operational database.
    #[must_use]
    pub const fn operational(&self) -> &Arc<AppDb> {
        &self.operational
    }

    /// Returns the telemetry database.
    #[must_use]
    pub const fn telemetry(&self) -> &Arc<AppDb> {
        &self.telemetry
    }

    /// Stages a report payload, registering the client on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for blank or oversized input and
    /// propagates storage failures.
    pub fn stage(
        &self,
        client_id: &str,
        report_id: &str,
        data: &str,
    ) -> Result<StageOutcome, StoreError> {
        validate_identifier("clientId", client_id)?;
        validate_identifier("reportId", report_id)?;
        if data.len() > MAX_REPORT_BYTES {
            return Err(StoreError::Validation(format!(
                "report payload exceeds {MAX_REPORT_BYTES} bytes"
            )));
        }
        let now = OffsetDateTime::now_utc();
        let mut tx = self.operational.begin()?;
        Client::touch(&self.operational, &mut tx, client_id, now)?;
        let mut report = StagedReport::new(&self.operational, client_id, report_id, data)?;
        if report.exists(&mut tx)? {
            tx.commit()?;
            let id = row_id(&report)?;
            debug!(client_id, report_id, staged_id = id, "report already staged");
            return Ok(StageOutcome::Duplicate {
                id,
            });
        }
        report.received_at = now;
        report.insert(&mut tx)?;
        tx.commit()?;
        let id = row_id(&report)?;
        info!(client_id, report_id, staged_id = id, bytes = data.len(), "report staged");
        Ok(StageOutcome::Staged {
            id,
        })
    }

    /// Claims the oldest unallocated report; `None` when there is no work.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn claim_next(&self) -> Result<Option<StagedReport>, StoreError> {
        let spec = reports_spec()?;
        let mut tx = self.operational.begin()?;
        let rows = select_rows(
            &mut tx,
            spec,
            &spec.column_names(),
            &["allocated"],
            &[SqlValue::Bool(false)],
            &SelectOptions::default().order_by("id").limit(1).for_update(),
        )?;
        let Some(row) = rows.first() else {
            tx.commit()?;
            return Ok(None);
        };
        let mut report = StagedReport::from_row(&self.operational, row)?;
        if !report.mark_allocated(&mut tx, OffsetDateTime::now_utc())? {
            tx.commit()?;
            return Ok(None);
        }
        tx.commit()?;
        debug!(report_id = %report.report_id, staged_id = report.id, "report claimed");
        Ok(Some(report))
    }

    /// Decodes a claimed report, stores its telemetry in one transaction, and
    /// deletes the staging row. Returns the number of items stored.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Payload`] for undecodable or inconsistent
    /// payloads and propagates processor and storage failures. The staging
    /// row is kept on failure.
    pub fn process(&self, report: &StagedReport) -> Result<usize, StoreError> {
        let payload = ReportPayload::from_json(&report.data)?;
        if payload.header.report_id != report.report_id {
            return Err(StoreError::Payload(format!(
                "payload reportId {} does not match staged reportId {}",
                payload.header.report_id, report.report_id
            )));
        }
        let mut resolved = Vec::with_capacity(payload.telemetry.len());
        for item in &payload.telemetry {
            let customer_id = item
                .header
                .customer_id
                .as_deref()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or(UNKNOWN_CUSTOMER);
            let customer = Customer::resolve(&self.telemetry, customer_id)?;
            let tag_set = TagSet::resolve(&self.telemetry, &payload.annotations_for(item))?;
            let customer_key = customer.id.ok_or_else(|| missing_id("customer"))?;
            resolved.push((customer_key, tag_set.and_then(|tags| tags.id), item.time_stamp()?));
        }
        let mut tx = self.telemetry.begin()?;
        for (item, (customer_id, tag_set_id, time_stamp)) in payload.telemetry.iter().zip(resolved)
        {
            let context = ItemContext {
                db: &self.telemetry,
                client_id: &report.client_id,
                report_id: &report.report_id,
                customer_id,
                tag_set_id,
                time_stamp,
                item,
            };
            self.registry.processor_for(&item.header.telemetry_type).process(&mut tx, &context)?;
        }
        tx.commit()?;
        report.delete(&mut self.operational.session()?)?;
        Ok(payload.telemetry.len())
    }

    /// Claims and processes reports until none remain unallocated.
    ///
    /// # Errors
    ///
    /// Returns [`DrainError`] listing every failed report when at least one
    /// failed; the summary still counts the successes.
    pub fn drain(&self) -> Result<DrainSummary, DrainError> {
        let mut summary = DrainSummary::default();
        let mut failures = Vec::new();
        loop {
            let report = match self.claim_next() {
                Ok(Some(report)) => report,
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "claim failed; stopping drain");
                    failures.push(ReportFailure {
                        staged_id: None,
                        report_id: None,
                        error: err.to_string(),
                    });
                    break;
                }
            };
            match self.process(&report) {
                Ok(items) => {
                    summary.processed += 1;
                    info!(report_id = %report.report_id, items, "report processed");
                }
                Err(err) => {
                    summary.failed += 1;
                    warn!(report_id = %report.report_id, error = %err, "report failed");
                    failures.push(ReportFailure {
                        staged_id: report.id,
                        report_id: Some(report.report_id.clone()),
                        error: err.to_string(),
                    });
                }
            }
        }
        if failures.is_empty() {
            Ok(summary)
        } else {
            Err(DrainError {
                summary,
                failures,
            })
        }
    }

    /// Counts unallocated reports.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn depth(&self) -> Result<u64, StoreError> {
        let spec = reports_spec()?;
        let rows = select_rows(
            &mut self.operational.session()?,
            spec,
            &[],
            &["allocated"],
            &[SqlValue::Bool(false)],
            &SelectOptions::default().count(),
        )?;
        let count = rows.first().map(|row| row.get_i64("count")).transpose()?.unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Lists claimed reports whose claim is at least `older_than` old, oldest
    /// first. Claims without a timestamp are always listed.
    ///
    /// # Errors
    ///
    /// Propagates storage failures.
    pub fn stale_claims(&self, older_than: Duration) -> Result<Vec<StagedReport>, StoreError> {
        let Some(cutoff) = time::Duration::try_from(older_than)
            .ok()
            .and_then(|age| OffsetDateTime::now_utc().checked_sub(age))
        else {
            return Ok(Vec::new());
        };
        let spec = reports_spec()?;
        let rows = select_rows(
            &mut self.operational.session()?,
            spec,
            &spec.column_names(),
            &["allocated"],
            &[SqlValue::Bool(true)],
            &SelectOptions::default().order_by("id"),
        )?;
        let mut stale = Vec::new();
        for row in &rows {
            let report = StagedReport::from_row(&self.operational, row)?;
            if report.allocated_at.is_none_or(|claimed| claimed <= cutoff) {
                stale.push(report);
            }
        }
        Ok(stale)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Rejects blank or oversized identifiers.
fn validate_identifier(field: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_BYTES {
        return Err(StoreError::Validation(format!("{field} exceeds {MAX_IDENTIFIER_BYTES} bytes")));
    }
    Ok(())
}

/// Returns the id of a stored report.
fn row_id(report: &StagedReport) -> Result<i64, StoreError> {
    report.id.ok_or_else(|| missing_id("staged report"))
}

/// Error for a stored row without an id.
fn missing_id(entity: &str) -> StoreError {
    StoreError::Db(DbError::Decode(format!("{entity} row has no id")))
}
