//! JSON file-backed workbook
//!
//! The whole workbook is a single JSON object mapping sheet name to rows.
//! Every mutation is written through to disk (temp file + rename) before the
//! call returns, so a killed process never leaves a half-written workbook. A
//! mutation whose file write fails is undone in memory as well.

use crate::error::TabularError;
use crate::grid::{Grid, Rect};
use crate::memory::MemoryWorkbook;
use crate::tabular::{Result, TabularStore};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Workbook persisted as a JSON document
#[derive(Debug)]
pub struct JsonWorkbook {
    path: PathBuf,
    inner: MemoryWorkbook,
    writer: Mutex<()>,
}

impl JsonWorkbook {
    /// Open the workbook at `path`, starting empty if the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sheets: BTreeMap<String, Grid> = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|source| TabularError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(TabularError::io_error(path, e)),
        };
        debug!("opened workbook {} ({} sheets)", path.display(), sheets.len());
        Ok(Self {
            path,
            inner: MemoryWorkbook::from_sheets(sheets),
            writer: Mutex::new(()),
        })
    }

    /// Backing file path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to the working copy and persist it, or neither
    fn commit(&self, change: impl FnOnce(&MemoryWorkbook) -> Result<()>) -> Result<()> {
        let _writer = self.writer.lock();
        let before = self.inner.snapshot();
        let result = change(&self.inner).and_then(|()| self.flush());
        if let Err(e) = &result {
            warn!("workbook {} unchanged: {}", self.path.display(), e);
            self.inner.replace(before);
        }
        result
    }

    fn flush(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.inner.snapshot()).map_err(|source| {
            TabularError::Corrupt {
                path: self.path.clone(),
                source,
            }
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| TabularError::io_error(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| TabularError::io_error(&self.path, e))
    }
}

impl TabularStore for JsonWorkbook {
    fn read_range(&self, sheet: &str, rect: Rect) -> Result<Grid> {
        self.inner.read_range(sheet, rect)
    }

    fn write_range(&self, sheet: &str, rect: Rect, values: &Grid) -> Result<()> {
        self.commit(|wb| wb.write_range(sheet, rect, values))
    }

    fn append_columns(&self, sheet: &str, position: usize, count: usize) -> Result<()> {
        self.commit(|wb| wb.append_columns(sheet, position, count))
    }

    fn last_row(&self, sheet: &str) -> Result<usize> {
        self.inner.last_row(sheet)
    }

    fn column_count(&self, sheet: &str) -> Result<usize> {
        self.inner.column_count(sheet)
    }

    fn sheet_exists(&self, sheet: &str) -> bool {
        self.inner.sheet_exists(sheet)
    }

    fn create_sheet(&self, sheet: &str) -> Result<()> {
        self.commit(|wb| wb.create_sheet(sheet))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.json");

        let wb = JsonWorkbook::open(&path).unwrap();
        wb.create_sheet("Out").unwrap();
        wb.write_row("Out", 3, &["a".to_string(), "b".to_string()])
            .unwrap();
        drop(wb);

        let wb = JsonWorkbook::open(&path).unwrap();
        assert_eq!(wb.last_row("Out").unwrap(), 3);
        assert_eq!(wb.read_row("Out", 3).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn failed_flush_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.json");
        let wb = JsonWorkbook::open(&path).unwrap();
        wb.create_sheet("Out").unwrap();
        wb.write_row("Out", 1, &["kept".to_string()]).unwrap();

        // a directory where the temp file should go makes every flush fail
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();
        let err = wb.write_row("Out", 1, &["lost".to_string()]).unwrap_err();
        assert!(matches!(err, TabularError::Io { .. }));
        assert_eq!(wb.read_row("Out", 1).unwrap(), vec!["kept"]);
        assert!(wb.create_sheet("Other").is_err());
        assert!(!wb.sheet_exists("Other"));
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonWorkbook::open(&path),
            Err(TabularError::Corrupt { .. })
        ));
    }
}
