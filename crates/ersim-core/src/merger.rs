//! Categorization merge
//!
//! Writes categorization results back into the designated category columns
//! of the sink. The target row is found by primary key first; only when the
//! primary key matches nothing does the secondary (legacy) key get a chance,
//! because secondary keys repeat across records.
//!
//! A key matching more than one row is reported as an ambiguity and nothing
//! is written for that item. Each item either updates every column it
//! carries or none of them.

use crate::config::{CategorizeSettings, PipelineConfig};
use crate::error::{MergeError, SchemaError};
use crate::schema::{resolve, FieldSpec, HeaderSnapshot, SchemaMap};
use ersim_sheets::{SheetLayout, TabularStore};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Results sheet column holding the primary key
pub const RESULT_CASE_ID: &str = "Case_Organization_Case_ID";
/// Results sheet column holding the secondary key
pub const RESULT_LEGACY_ID: &str = "Legacy_Case_ID";

/// Results sheet columns feeding each designated sink field, in order
/// symptom code, system code, symptom name, system name
pub const RESULT_FINAL_COLUMNS: [&str; 4] = [
    "Final_Symptom_Code",
    "Final_System_Code",
    "Final_Symptom_Name",
    "Final_System_Name",
];

/// One categorization to merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorizationResult {
    /// Unique record key
    pub primary_key: String,
    /// Legacy key, may repeat
    pub secondary_key: String,
    /// Logical output field -> value
    pub fields: IndexMap<String, String>,
}

impl CategorizationResult {
    /// Create a result with no fields
    #[must_use]
    pub fn new(primary_key: impl Into<String>, secondary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            secondary_key: secondary_key.into(),
            fields: IndexMap::new(),
        }
    }

    /// Add an output field
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// An item the merge could not apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeFailure {
    /// Position in the input
    pub index: usize,
    /// Primary key of the item
    pub primary_key: String,
    /// Secondary key of the item
    pub secondary_key: String,
    /// Why it failed
    pub reason: String,
}

/// Outcome of a merge pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    /// Items written
    pub updated: usize,
    /// Items rejected
    pub errors: usize,
    /// Details of rejected items
    pub failures: Vec<MergeFailure>,
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "updated {}, errors {}", self.updated, self.errors)
    }
}

/// Row lookup over one key column
#[derive(Debug, Default)]
struct KeyIndex {
    rows: HashMap<String, Vec<usize>>,
}

impl KeyIndex {
    fn build(
        store: &dyn TabularStore,
        sheet: &str,
        col: usize,
        first_row: usize,
    ) -> Result<Self, MergeError> {
        let mut rows: HashMap<String, Vec<usize>> = HashMap::new();
        let cells = store.read_column(sheet, col, first_row)?;
        for (offset, cell) in cells.into_iter().enumerate() {
            let key = cell.trim();
            if !key.is_empty() {
                rows.entry(key.to_string()).or_default().push(first_row + offset);
            }
        }
        Ok(Self { rows })
    }

    fn find(&self, kind: &'static str, key: &str) -> Result<Option<usize>, MergeError> {
        match self.rows.get(key).map(Vec::as_slice) {
            None | Some([]) => Ok(None),
            Some([row]) => Ok(Some(*row)),
            Some(rows) => Err(MergeError::LookupAmbiguity {
                key_kind: kind,
                key: key.to_string(),
                rows: rows.to_vec(),
            }),
        }
    }
}

/// Applies categorization results to the sink
#[derive(Clone)]
pub struct CategorizationMerger {
    store: Arc<dyn TabularStore>,
    sink: String,
    layout: SheetLayout,
    primary: FieldSpec,
    secondary: FieldSpec,
    outputs: Vec<FieldSpec>,
}

impl fmt::Debug for CategorizationMerger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CategorizationMerger")
            .field("sink", &self.sink)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl CategorizationMerger {
    /// Create a merger for the configured sink
    #[must_use]
    pub fn from_config(store: Arc<dyn TabularStore>, config: &PipelineConfig) -> Self {
        Self {
            store,
            sink: config.sheets.sink.clone(),
            layout: config.sheets.sink_layout(),
            primary: config.schema.primary_key.clone(),
            secondary: config.schema.secondary_key.clone(),
            outputs: config
                .categorize
                .output_fields()
                .into_iter()
                .cloned()
                .collect(),
        }
    }

    /// Merge `results` into the sink described by `sink_header`
    ///
    /// Per-item failures are collected in the report. Only store and schema
    /// errors abort the pass.
    pub fn apply(
        &self,
        results: &[CategorizationResult],
        sink_header: &HeaderSnapshot,
    ) -> Result<MergeReport, MergeError> {
        let mut specs = vec![self.primary.clone(), self.secondary.clone()];
        specs.extend(self.outputs.iter().cloned());
        let map = resolve(sink_header, &specs);

        let store = self.store.as_ref();
        let first = self.layout.first_data_row();
        let primary = KeyIndex::build(store, &self.sink, map.require(&self.primary.name)?, first)?;
        let secondary = match map.get(&self.secondary.name) {
            Some(col) => KeyIndex::build(store, &self.sink, col, first)?,
            None => {
                warn!("secondary key column missing, fallback lookup disabled");
                KeyIndex::default()
            }
        };

        let mut report = MergeReport::default();
        for (index, result) in results.iter().enumerate() {
            match self.apply_one(result, &map, &primary, &secondary) {
                Ok(row) => {
                    debug!("categorization {} written to row {}", result.primary_key, row);
                    report.updated += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("categorization {} skipped: {}", index, e);
                    report.errors += 1;
                    report.failures.push(MergeFailure {
                        index,
                        primary_key: result.primary_key.clone(),
                        secondary_key: result.secondary_key.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!("categorization merge into '{}': {}", self.sink, report);
        Ok(report)
    }

    fn apply_one(
        &self,
        result: &CategorizationResult,
        map: &SchemaMap,
        primary: &KeyIndex,
        secondary: &KeyIndex,
    ) -> Result<usize, MergeError> {
        let row = self.locate(result, primary, secondary)?;

        let mut writes = Vec::with_capacity(result.fields.len());
        for (name, value) in &result.fields {
            let col = self
                .outputs
                .iter()
                .find(|spec| &spec.name == name)
                .and_then(|spec| map.get(&spec.name))
                .ok_or_else(|| MergeError::UnknownField(name.clone()))?;
            writes.push((col, value));
        }
        if writes.is_empty() {
            return Ok(row);
        }

        // one read, one write: the row is either fully merged or untouched
        let mut cells = self.store.read_row(&self.sink, row)?;
        let width = writes.iter().map(|(col, _)| col + 1).max().unwrap_or(0);
        if cells.len() < width {
            cells.resize(width, String::new());
        }
        for (col, value) in writes {
            cells[col].clone_from(value);
        }
        self.store.write_row(&self.sink, row, &cells)?;
        Ok(row)
    }

    fn locate(
        &self,
        result: &CategorizationResult,
        primary: &KeyIndex,
        secondary: &KeyIndex,
    ) -> Result<usize, MergeError> {
        let pk = result.primary_key.trim();
        let sk = result.secondary_key.trim();
        if pk.is_empty() && sk.is_empty() {
            return Err(MergeError::MissingKey);
        }

        if !pk.is_empty() {
            if let Some(row) = primary.find("primary", pk)? {
                return Ok(row);
            }
        }
        if !sk.is_empty() {
            if let Some(row) = secondary.find("secondary", sk)? {
                debug!("primary '{}' missed, matched secondary '{}'", pk, sk);
                return Ok(row);
            }
        }
        Err(MergeError::NotFound {
            primary: pk.to_string(),
            secondary: sk.to_string(),
        })
    }
}

/// Read merge input from the categorization results sheet
///
/// The sheet has a single header row. Blank final values are left out so
/// they never clear an existing sink value.
pub fn read_results(
    store: &dyn TabularStore,
    results_sheet: &str,
    settings: &CategorizeSettings,
) -> Result<Vec<CategorizationResult>, MergeError> {
    let layout = SheetLayout::SINGLE;
    let width = store.column_count(results_sheet)?;
    if width == 0 {
        return Ok(Vec::new());
    }
    let header: Vec<String> = store
        .read_row(results_sheet, layout.field_header_row())?
        .into_iter()
        .map(|h| h.trim().to_string())
        .collect();
    let find = |name: &str| header.iter().position(|h| h == name);
    let require = |name: &str| {
        find(name).ok_or_else(|| MergeError::Schema(SchemaError::Unresolved(name.to_string())))
    };

    let case_col = require(RESULT_CASE_ID)?;
    let legacy_col = find(RESULT_LEGACY_ID);
    let mut value_cols = Vec::with_capacity(RESULT_FINAL_COLUMNS.len());
    for (column, spec) in RESULT_FINAL_COLUMNS.iter().zip(settings.output_fields()) {
        value_cols.push((require(column)?, spec.name.clone()));
    }

    let last = store.last_row(results_sheet)?;
    let mut results = Vec::new();
    for row in layout.first_data_row()..=last {
        let cells = store.read_row(results_sheet, row)?;
        let cell = |col: usize| cells.get(col).map_or("", |c| c.trim());
        let primary = cell(case_col);
        let secondary = legacy_col.map_or("", cell);
        if primary.is_empty() && secondary.is_empty() {
            continue;
        }

        let mut result = CategorizationResult::new(primary, secondary);
        for (col, name) in &value_cols {
            let value = cell(*col);
            if !value.is_empty() {
                result.fields.insert(name.clone(), value.to_string());
            }
        }
        results.push(result);
    }
    debug!("read {} categorization result(s) from '{}'", results.len(), results_sheet);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ersim_sheets::{Grid, MemoryWorkbook, Rect, TabularError};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SINK: &str = "Master Scenario Convert";

    fn s(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| (*c).to_string()).collect()
    }

    fn header() -> HeaderSnapshot {
        HeaderSnapshot {
            sheet: SINK.into(),
            groups: Vec::new(),
            fields: s(&[
                "Case_Organization_Case_ID",
                "Case_Organization_Legacy_Case_ID",
                "Case_Organization_Category_Symptom_Code",
                "Case_Organization_Category_System_Code",
                "Case_Organization_Category_Symptom",
                "Case_Organization_Category_System",
            ]),
            refreshed_at: Utc::now(),
        }
    }

    fn setup(rows: &[[&str; 2]]) -> (Arc<MemoryWorkbook>, CategorizationMerger) {
        let mut grid = vec![s(&["Case_Organization"; 6]), header().fields];
        grid.extend(rows.iter().map(|[pk, sk]| s(&[*pk, *sk, "", "", "", ""])));
        let store = Arc::new(MemoryWorkbook::new().with_sheet(SINK, grid));
        let merger = CategorizationMerger::from_config(store.clone(), &PipelineConfig::default());
        (store, merger)
    }

    fn cell(store: &MemoryWorkbook, row: usize, col: usize) -> String {
        store.read_range(SINK, Rect::cell(row, col)).unwrap()[0][0].clone()
    }

    #[test]
    fn primary_key_wins_over_shared_secondary() {
        let (store, merger) = setup(&[["A", "X"], ["B", "X"]]);
        let result = CategorizationResult::new("A", "X").with_field("symptom_code", "CP");

        let report = merger.apply(&[result], &header()).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(cell(&store, 3, 2), "CP");
        assert_eq!(cell(&store, 4, 2), "");
    }

    #[test]
    fn secondary_fallback_only_on_primary_miss() {
        let (store, merger) = setup(&[["A", "X"], ["B", "Y"]]);
        let result = CategorizationResult::new("Z", "Y").with_field("system", "Respiratory");

        merger.apply(&[result], &header()).unwrap();
        assert_eq!(cell(&store, 4, 5), "Respiratory");
    }

    #[test]
    fn ambiguous_secondary_is_an_item_error() {
        let (store, merger) = setup(&[["A", "X"], ["B", "X"]]);
        let result = CategorizationResult::new("Z", "X").with_field("symptom_code", "CP");

        let report = merger.apply(&[result], &header()).unwrap();
        assert_eq!(report.errors, 1);
        assert!(report.failures[0].reason.contains("rows [3, 4]"));
        assert_eq!(cell(&store, 3, 2), "");
        assert_eq!(cell(&store, 4, 2), "");
    }

    #[test]
    fn duplicate_primary_is_ambiguous() {
        let (_, merger) = setup(&[["A", "X"], ["A", "Y"]]);
        let result = CategorizationResult::new("A", "").with_field("symptom_code", "CP");
        let report = merger.apply(&[result], &header()).unwrap();
        assert!(report.failures[0].reason.starts_with("primary key 'A'"));
    }

    #[test]
    fn unknown_field_leaves_row_untouched() {
        let (store, merger) = setup(&[["A", "X"]]);
        let result = CategorizationResult::new("A", "X")
            .with_field("symptom_code", "CP")
            .with_field("difficulty", "hard");

        let report = merger.apply(&[result], &header()).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(cell(&store, 3, 2), "");
    }

    type StoreResult<T> = Result<T, TabularError>;

    /// Workbook counting writes, optionally rejecting all of them
    struct GuardedWorkbook {
        inner: MemoryWorkbook,
        writes: AtomicUsize,
        reject_writes: bool,
    }

    impl TabularStore for GuardedWorkbook {
        fn read_range(&self, sheet: &str, rect: Rect) -> StoreResult<Grid> {
            self.inner.read_range(sheet, rect)
        }

        fn write_range(&self, sheet: &str, rect: Rect, values: &Grid) -> StoreResult<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            if self.reject_writes {
                return Err(TabularError::invalid_range(sheet, "read-only"));
            }
            self.inner.write_range(sheet, rect, values)
        }

        fn append_columns(&self, sheet: &str, position: usize, count: usize) -> StoreResult<()> {
            self.inner.append_columns(sheet, position, count)
        }

        fn last_row(&self, sheet: &str) -> StoreResult<usize> {
            self.inner.last_row(sheet)
        }

        fn column_count(&self, sheet: &str) -> StoreResult<usize> {
            self.inner.column_count(sheet)
        }

        fn sheet_exists(&self, sheet: &str) -> bool {
            self.inner.sheet_exists(sheet)
        }

        fn create_sheet(&self, sheet: &str) -> StoreResult<()> {
            self.inner.create_sheet(sheet)
        }
    }

    fn guarded(reject_writes: bool) -> (Arc<GuardedWorkbook>, CategorizationMerger) {
        let mut grid = vec![s(&["Case_Organization"; 6]), header().fields];
        grid.push(s(&["A", "X", "", "", "", ""]));
        let store = Arc::new(GuardedWorkbook {
            inner: MemoryWorkbook::new().with_sheet(SINK, grid),
            writes: AtomicUsize::new(0),
            reject_writes,
        });
        let merger = CategorizationMerger::from_config(store.clone(), &PipelineConfig::default());
        (store, merger)
    }

    fn full_result() -> CategorizationResult {
        CategorizationResult::new("A", "X")
            .with_field("symptom_code", "CP")
            .with_field("system_code", "CARD")
            .with_field("symptom", "Chest Pain")
    }

    #[test]
    fn item_is_written_in_one_row_write() {
        let (store, merger) = guarded(false);
        let report = merger.apply(&[full_result()], &header()).unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(store.writes.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.inner.read_row(SINK, 3).unwrap(),
            s(&["A", "X", "CP", "CARD", "Chest Pain", ""])
        );
    }

    #[test]
    fn rejected_write_leaves_row_untouched() {
        let (store, merger) = guarded(true);
        let err = merger.apply(&[full_result()], &header()).unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(
            store.inner.read_row(SINK, 3).unwrap(),
            s(&["A", "X", "", "", "", ""])
        );
    }

    #[test]
    fn failures_do_not_stop_the_pass() {
        let (store, merger) = setup(&[["A", "X"], ["B", "Y"]]);
        let results = vec![
            CategorizationResult::new("", ""),
            CategorizationResult::new("nope", "nope"),
            CategorizationResult::new("B", "").with_field("system_code", "RESP"),
        ];
        let report = merger.apply(&results, &header()).unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors, 2);
        assert_eq!(report.failures[0].index, 0);
        assert_eq!(cell(&store, 4, 3), "RESP");
    }

    #[test]
    fn reads_results_sheet() {
        let store = MemoryWorkbook::new().with_sheet(
            "AI_Categorization_Results",
            vec![
                s(&[
                    "Case_Organization_Case_ID",
                    "Legacy_Case_ID",
                    "Final_Symptom_Code",
                    "Final_System_Code",
                    "Final_Symptom_Name",
                    "Final_System_Name",
                ]),
                s(&["CARD001", "L1", "CP", "CARD", "Chest Pain", ""]),
                s(&["", "", "", "", "", ""]),
                s(&["", "L2", "SOB", "", "", ""]),
            ],
        );
        let settings = CategorizeSettings::default();
        let results = read_results(&store, "AI_Categorization_Results", &settings).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].fields.len(), 3);
        assert_eq!(results[0].fields["symptom"], "Chest Pain");
        assert_eq!(results[1].primary_key, "");
        assert_eq!(results[1].secondary_key, "L2");
    }
}
