// crates/telemetry-store/src/processor.rs
// ============================================================================
// Module: Telemetry Processors
// Description: Per-type handlers that persist decoded telemetry items.
// Purpose: Dispatch items by telemetry type with a mandatory fallback.
// Dependencies: serde_json, telemetry-db
// ============================================================================

//! ## Overview
//! A [`TelemetryProcessorRegistry`] is built once at start-up and passed to
//! the staging queue. Items whose type has no registered processor go to
//! the default processor, which [`TelemetryProcessorRegistryBuilder::build`]
//! requires. [`DefaultProcessor`] stores each item as one
//! [`TelemetryData`] row and skips items already stored, so reprocessing a
//! report after a crash does not duplicate rows.

use std::collections::HashMap;
use std::sync::Arc;

use telemetry_db::AppDb;
use telemetry_db::Executor;
use telemetry_db::Row;
use time::OffsetDateTime;
use tracing::debug;

use crate::entities::telemetry_data::TelemetryData;
use crate::entities::telemetry_data::TelemetryDataFields;
use crate::error::StoreError;
use crate::payload::TelemetryItem;

// ============================================================================
// SECTION: Processor Contract
// ============================================================================

/// Everything a processor knows about one item.
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    /// Telemetry database, for building rows.
    ///
    /// All statements go through the executor passed to
    /// [`TelemetryProcessor::process`]. The report's transaction already holds
    /// the connection, so `db.session()` or `db.begin()` from a processor fails
    /// with [`telemetry_db::DbError::Usage`] on single-connection backends.
    pub db: &'a Arc<AppDb>,
    /// Submitting client.
    pub client_id: &'a str,
    /// Report the item arrived in.
    pub report_id: &'a str,
    /// Resolved customer key.
    pub customer_id: i64,
    /// Resolved tag set key, if annotated.
    pub tag_set_id: Option<i64>,
    /// Parsed item timestamp.
    pub time_stamp: OffsetDateTime,
    /// The item.
    pub item: &'a TelemetryItem,
}

/// Persists telemetry items of one or more types.
pub trait TelemetryProcessor: Send + Sync {
    /// Persists one item inside the report's transaction, using only
    /// `executor`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the item cannot be stored; the whole report
    /// is rolled back.
    fn process(
        &self,
        executor: &mut dyn Executor,
        item: &ItemContext<'_>,
    ) -> Result<(), StoreError>;
}

/// Stores every item as a generic [`TelemetryData`] row.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultProcessor;

impl TelemetryProcessor for DefaultProcessor {
    fn process(
        &self,
        executor: &mut dyn Executor,
        item: &ItemContext<'_>,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(&item.item.telemetry_data)
            .map_err(|err| StoreError::Processor(err.to_string()))?;
        let mut row = TelemetryData::new(item.db, TelemetryDataFields {
            customer_id: item.customer_id,
            tag_set_id: item.tag_set_id,
            client_id: item.client_id.to_string(),
            report_id: item.report_id.to_string(),
            telemetry_id: item.item.header.telemetry_id.clone(),
            telemetry_type: item.item.header.telemetry_type.clone(),
            telemetry_time_stamp: item.time_stamp,
            data,
        })?;
        if row.exists(executor)? {
            debug!(
                report_id = item.report_id,
                telemetry_id = %item.item.header.telemetry_id,
                "telemetry already stored"
            );
            return Ok(());
        }
        row.insert(executor)?;
        Ok(())
    }
}

// ============================================================================
// SECTION: Registry
// ============================================================================

/// Telemetry type to processor dispatch table.
#[derive(Clone)]
pub struct TelemetryProcessorRegistry {
    /// Fallback for unregistered types.
    default: Arc<dyn TelemetryProcessor>,
    /// Registered processors by type.
    by_type: HashMap<String, Arc<dyn TelemetryProcessor>>,
}

impl TelemetryProcessorRegistry {
    /// Starts a registry.
    #[must_use]
    pub fn builder() -> TelemetryProcessorRegistryBuilder {
        TelemetryProcessorRegistryBuilder::default()
    }

    /// Registry that stores every type with [`DefaultProcessor`].
    #[must_use]
    pub fn standard() -> Self {
        Self {
            default: Arc::new(DefaultProcessor),
            by_type: HashMap::new(),
        }
    }

    /// Returns the processor for `telemetry_type`.
    #[must_use]
    pub fn processor_for(&self, telemetry_type: &str) -> &dyn TelemetryProcessor {
        self.by_type.get(telemetry_type).map_or(self.default.as_ref(), Arc::as_ref)
    }

    /// Returns true when `telemetry_type` has a dedicated processor.
    #[must_use]
    pub fn is_registered(&self, telemetry_type: &str) -> bool {
        self.by_type.contains_key(telemetry_type)
    }
}

impl std::fmt::Debug for TelemetryProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("TelemetryProcessorRegistry").field("types", &types).finish_non_exhaustive()
    }
}

/// Builder validating a [`TelemetryProcessorRegistry`].
#[derive(Default)]
pub struct TelemetryProcessorRegistryBuilder {
    /// Fallback processor, required.
    default: Option<Arc<dyn TelemetryProcessor>>,
    /// Registered processors by type.
    by_type: HashMap<String, Arc<dyn TelemetryProcessor>>,
    /// First type registered twice.
    duplicate: Option<String>,
}

impl TelemetryProcessorRegistryBuilder {
    /// Sets the fallback processor.
    #[must_use]
    pub fn default_processor(mut self, processor: impl TelemetryProcessor + 'static) -> Self {
        self.default = Some(Arc::new(processor));
        self
    }

    /// Registers a processor for one telemetry type.
    #[must_use]
    pub fn register(
        mut self,
        telemetry_type: &str,
        processor: impl TelemetryProcessor + 'static,
    ) -> Self {
        let previous = self.by_type.insert(telemetry_type.to_string(), Arc::new(processor));
        if previous.is_some() && self.duplicate.is_none() {
            self.duplicate = Some(telemetry_type.to_string());
        }
        self
    }

    /// Validates and returns the registry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Registry`] when no default processor was set, a
    /// type was registered twice, or a type name is blank.
    pub fn build(self) -> Result<TelemetryProcessorRegistry, StoreError> {
        if let Some(duplicate) = self.duplicate {
            return Err(StoreError::Registry(format!(
                "telemetry type {duplicate} registered twice"
            )));
        }
        if self.by_type.keys().any(|name| name.trim().is_empty()) {
            return Err(StoreError::Registry("telemetry type must not be empty".to_string()));
        }
        let default = self
            .default
            .ok_or_else(|| StoreError::Registry("default processor is required".to_string()))?;
        Ok(TelemetryProcessorRegistry {
            default,
            by_type: self.by_type,
        })
    }
}

impl std::fmt::Debug for TelemetryProcessorRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryProcessorRegistryBuilder")
            .field("has_default", &self.default.is_some())
            .finish_non_exhaustive()
    }
}
