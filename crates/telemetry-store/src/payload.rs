// crates/telemetry-store/src/payload.rs
// ============================================================================
// Module: Report Payload
// Description: JSON wire format of a submitted report.
// Purpose: Decode staged payloads into typed telemetry items.
// Dependencies: serde, serde_json, telemetry-db, time
// ============================================================================

//! ## Overview
//! A report carries a header and a list of telemetry items:
//!
//! ```json
//! {
//!   "header": {
//!     "reportId": "r1",
//!     "reportTimeStamp": "2024-05-01T10:00:00Z",
//!     "reportClientId": "c1",
//!     "reportAnnotations": {"site": "lab"}
//!   },
//!   "telemetry": [
//!     {
//!       "header": {
//!         "telemetryId": "t1",
//!         "telemetryType": "cpu",
//!         "telemetryTimeStamp": "2024-05-01T09:59:00Z",
//!         "telemetryAnnotations": {"host": "a"},
//!         "customerId": "acme"
//!       },
//!       "telemetryData": {"load": 0.4}
//!     }
//!   ]
//! }
//! ```
//!
//! Timestamps are RFC 3339. Annotations and `customerId` are optional; the
//! item data is kept as arbitrary JSON.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use telemetry_db::value::parse_timestamp;
use time::OffsetDateTime;

use crate::error::StoreError;

/// Report header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportHeader {
    /// Report identifier.
    pub report_id: String,
    /// Report creation time (RFC 3339).
    pub report_time_stamp: String,
    /// Submitting client.
    pub report_client_id: String,
    /// Annotations applied to every item of the report.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub report_annotations: BTreeMap<String, String>,
}

/// Header of one telemetry item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryHeader {
    /// Item identifier, unique within the report.
    pub telemetry_id: String,
    /// Telemetry type, used to select a processor.
    pub telemetry_type: String,
    /// Item creation time (RFC 3339).
    pub telemetry_time_stamp: String,
    /// Item annotations; override report annotations on key collisions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub telemetry_annotations: BTreeMap<String, String>,
    /// Customer the item belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
}

/// One telemetry item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryItem {
    /// Item header.
    pub header: TelemetryHeader,
    /// Type-specific data.
    #[serde(default)]
    pub telemetry_data: Value,
}

impl TelemetryItem {
    /// Parses the item timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Payload`] for a malformed timestamp.
    pub fn time_stamp(&self) -> Result<OffsetDateTime, StoreError> {
        parse_timestamp(&self.header.telemetry_time_stamp).map_err(|err| {
            StoreError::Payload(format!("telemetry {}: {err}", self.header.telemetry_id))
        })
    }
}

/// A decoded report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    /// Report header.
    pub header: ReportHeader,
    /// Telemetry items.
    #[serde(default)]
    pub telemetry: Vec<TelemetryItem>,
}

impl ReportPayload {
    /// Decodes and validates a report.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Payload`] when the JSON is malformed, an
    /// identifier is blank, a timestamp does not parse, or item identifiers
    /// repeat.
    pub fn from_json(text: &str) -> Result<Self, StoreError> {
        let payload: Self =
            serde_json::from_str(text).map_err(|err| StoreError::Payload(err.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Checks identifiers and timestamps.
    ///
    /// # Errors
    ///
    /// See [`ReportPayload::from_json`].
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.header.report_id.trim().is_empty() {
            return Err(StoreError::Payload("reportId must not be empty".to_string()));
        }
        parse_timestamp(&self.header.report_time_stamp)
            .map_err(|err| StoreError::Payload(format!("reportTimeStamp: {err}")))?;
        let mut seen = std::collections::HashSet::new();
        for item in &self.telemetry {
            if item.header.telemetry_id.trim().is_empty() {
                return Err(StoreError::Payload("telemetryId must not be empty".to_string()));
            }
            if item.header.telemetry_type.trim().is_empty() {
                return Err(StoreError::Payload(format!(
                    "telemetry {} has no telemetryType",
                    item.header.telemetry_id
                )));
            }
            if !seen.insert(item.header.telemetry_id.as_str()) {
                return Err(StoreError::Payload(format!(
                    "telemetry {} appears twice",
                    item.header.telemetry_id
                )));
            }
            item.time_stamp()?;
        }
        Ok(())
    }

    /// Returns the annotations for `item`: report annotations overlaid with
    /// the item's own.
    #[must_use]
    pub fn annotations_for(&self, item: &TelemetryItem) -> BTreeMap<String, String> {
        let mut merged = self.header.report_annotations.clone();
        merged.extend(
            item.header.telemetry_annotations.iter().map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }
}
