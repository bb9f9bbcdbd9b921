//! Schema resolution
//!
//! Maps logical field names to column indices using the Tier-2 header row,
//! so the pipeline survives columns being inserted, moved or renamed.
//!
//! - [`SchemaResolver::refresh`] reads the header once and persists a snapshot
//! - [`resolve`] maps a field list against a snapshot, falling back to each
//!   field's static index (with a warning) when its header is absent
//!
//! Refresh is always explicit; read paths only ever use a persisted snapshot.

use crate::error::SchemaError;
use chrono::{DateTime, Utc};
use ersim_sheets::{get_json, set_json, KeyValueStore, Rect, SheetLayout, TabularStore};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Logical field with its expected header and static fallback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Logical name used by the pipeline
    pub name: String,
    /// Fully-qualified Tier-2 header
    pub header: String,
    /// Column index used when the header is not found
    #[serde(default)]
    pub fallback: Option<usize>,
    /// Human-readable label for prompts
    #[serde(default)]
    pub label: Option<String>,
}

impl FieldSpec {
    /// Create a field spec with a fallback index
    #[must_use]
    pub fn new(name: impl Into<String>, header: impl Into<String>, fallback: usize) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            fallback: Some(fallback),
            label: None,
        }
    }

    /// Create a field spec that must be found by header
    #[must_use]
    pub fn header_only(name: impl Into<String>, header: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            header: header.into(),
            fallback: None,
            label: None,
        }
    }

    /// Set prompt label
    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label for prompts, defaulting to the header
    #[must_use]
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.header)
    }
}

/// Header rows captured at refresh time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSnapshot {
    /// Sheet the snapshot was taken from
    pub sheet: String,
    /// Tier-1 group per column, forward-filled across merged groups
    pub groups: Vec<String>,
    /// Tier-2 fully-qualified field names
    pub fields: Vec<String>,
    /// When the snapshot was taken
    pub refreshed_at: DateTime<Utc>,
}

/// A column available for selection, with its group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableField {
    /// Tier-1 group name (empty for single-header sheets)
    pub group: String,
    /// Tier-2 field name
    pub name: String,
}

impl HeaderSnapshot {
    /// Column index of an exact header, if present
    #[must_use]
    pub fn position(&self, header: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == header)
    }

    /// Number of header columns
    #[inline]
    #[must_use]
    pub fn width(&self) -> usize {
        self.fields.len()
    }

    /// Non-empty header fields with their groups
    #[must_use]
    pub fn available_fields(&self) -> Vec<AvailableField> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, name)| !name.is_empty())
            .map(|(i, name)| AvailableField {
                group: self.groups.get(i).cloned().unwrap_or_default(),
                name: name.clone(),
            })
            .collect()
    }
}

/// A field that could not be found by header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaWarning {
    /// Logical field name
    pub field: String,
    /// Header that was looked for
    pub header: String,
    /// Index used instead, if any
    pub fallback: Option<usize>,
}

impl fmt::Display for SchemaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fallback {
            Some(idx) => write!(
                f,
                "header '{}' for '{}' not found, using fallback column {}",
                self.header, self.field, idx
            ),
            None => write!(
                f,
                "header '{}' for '{}' not found and no fallback",
                self.header, self.field
            ),
        }
    }
}

/// Resolved logical-field to column map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaMap {
    columns: IndexMap<String, usize>,
    warnings: Vec<SchemaWarning>,
}

impl SchemaMap {
    /// Column index of a logical field
    #[inline]
    #[must_use]
    pub fn get(&self, name: &str) -> Option<usize> {
        self.columns.get(name).copied()
    }

    /// Column index of a field that must resolve
    pub fn require(&self, name: &str) -> Result<usize, SchemaError> {
        self.get(name)
            .ok_or_else(|| SchemaError::Unresolved(name.to_string()))
    }

    /// Fallbacks and misses recorded during resolution
    #[inline]
    #[must_use]
    pub fn warnings(&self) -> &[SchemaWarning] {
        &self.warnings
    }

    /// Resolved fields in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of resolved fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether nothing resolved
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Resolve `fields` against a header snapshot
///
/// Each field missing from the header yields exactly one warning and uses its
/// fallback index; fields without a fallback are left unresolved.
#[must_use]
pub fn resolve(snapshot: &HeaderSnapshot, fields: &[FieldSpec]) -> SchemaMap {
    let mut map = SchemaMap::default();
    for spec in fields {
        if let Some(idx) = snapshot.position(&spec.header) {
            if spec.fallback.is_some_and(|f| f != idx) {
                debug!(
                    "'{}' moved to column {} (fallback {:?})",
                    spec.header, idx, spec.fallback
                );
            }
            map.columns.insert(spec.name.clone(), idx);
            continue;
        }

        let warning = SchemaWarning {
            field: spec.name.clone(),
            header: spec.header.clone(),
            fallback: spec.fallback,
        };
        warn!("{} on '{}'", warning, snapshot.sheet);
        if let Some(idx) = spec.fallback {
            map.columns.insert(spec.name.clone(), idx);
        }
        map.warnings.push(warning);
    }
    map
}

/// Reads header rows and manages persisted snapshots
#[derive(Clone)]
pub struct SchemaResolver {
    kv: Arc<dyn KeyValueStore>,
}

impl fmt::Debug for SchemaResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaResolver").finish_non_exhaustive()
    }
}

fn key(sheet: &str, part: &str) -> String {
    format!("schema.{sheet}.{part}")
}

impl SchemaResolver {
    /// Create a resolver persisting snapshots in `kv`
    #[inline]
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Read the header rows of `sheet` and persist a fresh snapshot
    pub fn refresh(
        &self,
        store: &dyn TabularStore,
        sheet: &str,
        layout: SheetLayout,
    ) -> Result<HeaderSnapshot, SchemaError> {
        let field_row = layout.field_header_row();
        let width = store.column_count(sheet)?;
        if width == 0 {
            return Err(SchemaError::MissingHeaderRow {
                sheet: sheet.to_string(),
                row: field_row,
            });
        }

        let header = store.read_range(sheet, Rect::new(1, 0, layout.header_rows.max(1), width))?;
        let fields: Vec<String> = header
            .last()
            .map(|r| r.iter().map(|c| c.trim().to_string()).collect())
            .unwrap_or_default();
        if fields.iter().all(String::is_empty) {
            return Err(SchemaError::MissingHeaderRow {
                sheet: sheet.to_string(),
                row: field_row,
            });
        }

        let groups = if layout.header_rows >= 2 {
            forward_fill(&header[0])
        } else {
            Vec::new()
        };

        let snapshot = HeaderSnapshot {
            sheet: sheet.to_string(),
            groups,
            fields,
            refreshed_at: Utc::now(),
        };
        self.persist(&snapshot)?;
        info!(
            "refreshed header of '{}' ({} columns)",
            sheet,
            snapshot.fields.len()
        );
        Ok(snapshot)
    }

    /// Persisted snapshot, if any
    pub fn load_cached(&self, sheet: &str) -> Result<Option<HeaderSnapshot>, SchemaError> {
        let Some(fields) = get_json::<Vec<String>>(self.kv.as_ref(), &key(sheet, "fields"))? else {
            return Ok(None);
        };
        let groups = get_json::<Vec<String>>(self.kv.as_ref(), &key(sheet, "groups"))?
            .unwrap_or_default();
        let refreshed_at = get_json::<DateTime<Utc>>(self.kv.as_ref(), &key(sheet, "refreshed_at"))?
            .unwrap_or_else(Utc::now);
        Ok(Some(HeaderSnapshot {
            sheet: sheet.to_string(),
            groups,
            fields,
            refreshed_at,
        }))
    }

    /// Persisted snapshot, failing if no refresh has happened
    pub fn cached(&self, sheet: &str) -> Result<HeaderSnapshot, SchemaError> {
        self.load_cached(sheet)?
            .ok_or_else(|| SchemaError::NotRefreshed(sheet.to_string()))
    }

    /// Drop the persisted snapshot of `sheet`
    pub fn invalidate(&self, sheet: &str) -> Result<(), SchemaError> {
        for part in ["fields", "groups", "refreshed_at"] {
            self.kv.delete(&key(sheet, part))?;
        }
        debug!("invalidated header snapshot of '{}'", sheet);
        Ok(())
    }

    // groups and fields live under separate keys to stay below per-value limits
    fn persist(&self, snapshot: &HeaderSnapshot) -> Result<(), SchemaError> {
        let kv = self.kv.as_ref();
        set_json(kv, &key(&snapshot.sheet, "fields"), &snapshot.fields)?;
        set_json(kv, &key(&snapshot.sheet, "groups"), &snapshot.groups)?;
        set_json(kv, &key(&snapshot.sheet, "refreshed_at"), &snapshot.refreshed_at)?;
        Ok(())
    }
}

fn forward_fill(row: &[String]) -> Vec<String> {
    let mut current = String::new();
    row.iter()
        .map(|cell| {
            let cell = cell.trim();
            if !cell.is_empty() {
                current = cell.to_string();
            }
            current.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ersim_sheets::{MemoryKv, MemoryWorkbook};
    use pretty_assertions::assert_eq;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| (*c).to_string()).collect()
    }

    fn snapshot(fields: &[&str]) -> HeaderSnapshot {
        HeaderSnapshot {
            sheet: "Master".into(),
            groups: Vec::new(),
            fields: row(fields),
            refreshed_at: Utc::now(),
        }
    }

    #[test]
    fn present_header_wins_over_fallback() {
        let snap = snapshot(&["Case_ID", "Title", "Vitals"]);
        let map = resolve(&snap, &[FieldSpec::new("vitals", "Vitals", 0)]);
        assert_eq!(map.get("vitals"), Some(2));
        assert!(map.warnings().is_empty());
    }

    #[test]
    fn missing_header_uses_fallback_with_one_warning() {
        let snap = snapshot(&["Case_ID", "Title"]);
        let map = resolve(
            &snap,
            &[
                FieldSpec::new("vitals", "Vitals", 7),
                FieldSpec::new("title", "Title", 1),
            ],
        );
        assert_eq!(map.get("vitals"), Some(7));
        assert_eq!(map.get("title"), Some(1));
        assert_eq!(map.warnings().len(), 1);
        assert_eq!(map.warnings()[0].field, "vitals");
    }

    #[test]
    fn header_only_field_stays_unresolved() {
        let snap = snapshot(&["Case_ID"]);
        let map = resolve(&snap, &[FieldSpec::header_only("legacy", "Legacy_Case_ID")]);
        assert_eq!(map.get("legacy"), None);
        assert!(matches!(map.require("legacy"), Err(SchemaError::Unresolved(_))));
        assert_eq!(map.warnings().len(), 1);
    }

    #[test]
    fn refresh_persists_and_invalidates() {
        let store = MemoryWorkbook::new().with_sheet(
            "Master",
            vec![
                row(&["Case_Organization", "", "Monitor"]),
                row(&["Case_ID ", "Spark_Title", "Initial_Vitals"]),
            ],
        );
        let resolver = SchemaResolver::new(Arc::new(MemoryKv::new()));

        let snap = resolver
            .refresh(&store, "Master", SheetLayout::TWO_TIER)
            .unwrap();
        assert_eq!(snap.fields, row(&["Case_ID", "Spark_Title", "Initial_Vitals"]));
        assert_eq!(
            snap.groups,
            row(&["Case_Organization", "Case_Organization", "Monitor"])
        );

        let cached = resolver.cached("Master").unwrap();
        assert_eq!(cached.fields, snap.fields);
        assert_eq!(cached.available_fields()[1].group, "Case_Organization");

        resolver.invalidate("Master").unwrap();
        assert!(matches!(
            resolver.cached("Master"),
            Err(SchemaError::NotRefreshed(_))
        ));
    }

    #[test]
    fn empty_header_row_is_fatal() {
        let store = MemoryWorkbook::new().with_sheet(
            "Master",
            vec![row(&["Group"]), row(&[""]), row(&["data"])],
        );
        let resolver = SchemaResolver::new(Arc::new(MemoryKv::new()));
        assert!(matches!(
            resolver.refresh(&store, "Master", SheetLayout::TWO_TIER),
            Err(SchemaError::MissingHeaderRow { row: 2, .. })
        ));

        let blank = MemoryWorkbook::new().with_sheet("Empty", Vec::new());
        assert!(matches!(
            resolver.refresh(&blank, "Empty", SheetLayout::TWO_TIER),
            Err(SchemaError::MissingHeaderRow { .. })
        ));
    }
}
