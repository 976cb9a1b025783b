// crates/telemetry-store/src/entities/tag_set.rs
// ============================================================================
// Module: Tag Set Entity
// Description: Distinct annotation sets attached to telemetry items.
// Purpose: Store each annotation combination once and reference it by key.
// Dependencies: serde_json, telemetry-db
// ============================================================================

//! ## Overview
//! A tag set is stored as the canonical JSON object of its annotations.
//! Annotations are held in a sorted map, so equal sets always render to the
//! same text and share one row.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::LazyLock;

use telemetry_db::AppDb;
use telemetry_db::Column;
use telemetry_db::DbError;
use telemetry_db::Row;
use telemetry_db::RowState;
use telemetry_db::SqlRow;
use telemetry_db::SqlType;
use telemetry_db::SqlValue;
use telemetry_db::TableSpec;
use telemetry_db::unknown_column;

use super::SpecCell;
use super::resolve_row;
use super::spec_ref;
use crate::error::StoreError;

/// Name of the tag sets table.
pub const TAG_SETS_TABLE: &str = "tagSets";

/// Specification of the tag sets table.
static TAG_SETS: SpecCell = LazyLock::new(|| {
    TableSpec::builder(TAG_SETS_TABLE)
        .column(Column::identity("id"))
        .column(Column::new("tagSet", SqlType::Text).unique())
        .build()
});

/// Returns the tag sets table specification.
///
/// # Errors
///
/// Returns [`DbError::Validation`] if the specification is malformed.
pub fn tag_sets_spec() -> Result<&'static TableSpec, DbError> {
    spec_ref(&TAG_SETS)
}

/// A distinct set of annotations.
#[derive(Debug, Clone)]
pub struct TagSet {
    /// Row state.
    state: RowState,
    /// Backend-assigned id.
    pub id: Option<i64>,
    /// Canonical JSON rendering of the annotations.
    pub tag_set: String,
}

impl TagSet {
    /// Renders annotations canonically; `None` for an empty set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Payload`] if the annotations cannot be rendered.
    pub fn canonical(
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<String>, StoreError> {
        if annotations.is_empty() {
            return Ok(None);
        }
        serde_json::to_string(annotations)
            .map(Some)
            .map_err(|err| StoreError::Payload(format!("annotations: {err}")))
    }

    /// Creates an unsaved tag set from its canonical text.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Validation`] if the table specification is malformed.
    pub fn new(db: &Arc<AppDb>, tag_set: &str) -> Result<Self, DbError> {
        Ok(Self {
            state: RowState::new(db, tag_sets_spec()?),
            id: None,
            tag_set: tag_set.to_string(),
        })
    }

    /// Returns the stored tag set for `annotations`, creating it on first
    /// use; `None` when there are no annotations.
    ///
    /// # Errors
    ///
    /// Propagates rendering and storage failures.
    pub fn resolve(
        db: &Arc<AppDb>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Option<Self>, StoreError> {
        let Some(canonical) = Self::canonical(annotations)? else {
            return Ok(None);
        };
        let mut tag_set = Self::new(db, &canonical)?;
        resolve_row(db, &mut tag_set)?;
        Ok(Some(tag_set))
    }
}

impl Row for TagSet {
    fn state(&self) -> &RowState {
        &self.state
    }

    fn lookup_columns(&self) -> &'static [&'static str] {
        &["tagSet"]
    }

    fn values(&self, columns: &[&str]) -> Result<Vec<SqlValue>, DbError> {
        columns
            .iter()
            .map(|column| match *column {
                "id" => Ok(SqlValue::from(self.id)),
                "tagSet" => Ok(SqlValue::from(self.tag_set.as_str())),
                other => Err(unknown_column(self.state.spec(), other)),
            })
            .collect()
    }

    fn load(&mut self, row: &SqlRow) -> Result<(), DbError> {
        self.id = Some(row.get_i64("id")?);
        self.tag_set = row.get_string("tagSet")?;
        Ok(())
    }

    fn set_identity(&mut self, id: i64) {
        self.id = Some(id);
    }
}
