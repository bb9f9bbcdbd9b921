//! In-memory workbook

use crate::error::TabularError;
use crate::grid::{is_blank_row, Grid, Rect};
use crate::tabular::{Result, TabularStore};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Workbook held entirely in memory
///
/// Used directly by tests and as the working copy behind
/// [`crate::JsonWorkbook`].
#[derive(Debug, Default)]
pub struct MemoryWorkbook {
    sheets: RwLock<BTreeMap<String, Grid>>,
}

impl MemoryWorkbook {
    /// Create an empty workbook
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a workbook from existing sheet contents
    #[must_use]
    pub fn from_sheets(sheets: BTreeMap<String, Grid>) -> Self {
        Self {
            sheets: RwLock::new(sheets),
        }
    }

    /// Add (or replace) a sheet with the given rows
    #[must_use]
    pub fn with_sheet(self, name: impl Into<String>, rows: Grid) -> Self {
        self.sheets.write().insert(name.into(), rows);
        self
    }

    /// Copy of all sheet contents
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Grid> {
        self.sheets.read().clone()
    }

    /// Replace all sheet contents
    pub(crate) fn replace(&self, sheets: BTreeMap<String, Grid>) {
        *self.sheets.write() = sheets;
    }

    /// Copy of one sheet trimmed to its populated rows
    #[must_use]
    pub fn sheet(&self, name: &str) -> Option<Grid> {
        let sheets = self.sheets.read();
        let grid = sheets.get(name)?;
        let last = populated_rows(grid);
        Some(grid[..last].to_vec())
    }
}

fn populated_rows(grid: &Grid) -> usize {
    grid.iter().rposition(|r| !is_blank_row(r)).map_or(0, |i| i + 1)
}

fn check_rect(sheet: &str, rect: Rect) -> Result<()> {
    if rect.row == 0 {
        return Err(TabularError::invalid_range(sheet, "rows are 1-based"));
    }
    if rect.is_empty() {
        return Err(TabularError::invalid_range(sheet, "empty range"));
    }
    Ok(())
}

impl TabularStore for MemoryWorkbook {
    fn read_range(&self, sheet: &str, rect: Rect) -> Result<Grid> {
        check_rect(sheet, rect)?;
        let sheets = self.sheets.read();
        let grid = sheets
            .get(sheet)
            .ok_or_else(|| TabularError::SheetNotFound(sheet.to_string()))?;

        let out = (rect.row..rect.row + rect.rows)
            .map(|r| {
                let src = grid.get(r - 1);
                (rect.col..rect.col + rect.cols)
                    .map(|c| src.and_then(|row| row.get(c)).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();
        Ok(out)
    }

    fn write_range(&self, sheet: &str, rect: Rect, values: &Grid) -> Result<()> {
        check_rect(sheet, rect)?;
        if !rect.fits(values) {
            return Err(TabularError::ShapeMismatch {
                expected_rows: rect.rows,
                expected_cols: rect.cols,
                actual_rows: values.len(),
                actual_cols: values.first().map_or(0, Vec::len),
            });
        }

        let mut sheets = self.sheets.write();
        let grid = sheets
            .get_mut(sheet)
            .ok_or_else(|| TabularError::SheetNotFound(sheet.to_string()))?;

        if grid.len() < rect.last_row() {
            grid.resize_with(rect.last_row(), Vec::new);
        }
        for (offset, src) in values.iter().enumerate() {
            let row = &mut grid[rect.row - 1 + offset];
            if row.len() < rect.col + rect.cols {
                row.resize(rect.col + rect.cols, String::new());
            }
            row[rect.col..rect.col + rect.cols].clone_from_slice(src);
        }
        Ok(())
    }

    fn append_columns(&self, sheet: &str, position: usize, count: usize) -> Result<()> {
        let mut sheets = self.sheets.write();
        let grid = sheets
            .get_mut(sheet)
            .ok_or_else(|| TabularError::SheetNotFound(sheet.to_string()))?;

        for row in grid.iter_mut() {
            if row.len() > position {
                row.splice(position..position, std::iter::repeat(String::new()).take(count));
            }
        }
        tracing::debug!("inserted {} column(s) at {} on '{}'", count, position, sheet);
        Ok(())
    }

    fn last_row(&self, sheet: &str) -> Result<usize> {
        let sheets = self.sheets.read();
        let grid = sheets
            .get(sheet)
            .ok_or_else(|| TabularError::SheetNotFound(sheet.to_string()))?;
        Ok(populated_rows(grid))
    }

    fn column_count(&self, sheet: &str) -> Result<usize> {
        let sheets = self.sheets.read();
        let grid = sheets
            .get(sheet)
            .ok_or_else(|| TabularError::SheetNotFound(sheet.to_string()))?;
        Ok(grid
            .iter()
            .filter_map(|r| r.iter().rposition(|c| !c.is_empty()).map(|i| i + 1))
            .max()
            .unwrap_or(0))
    }

    fn sheet_exists(&self, sheet: &str) -> bool {
        self.sheets.read().contains_key(sheet)
    }

    fn create_sheet(&self, sheet: &str) -> Result<()> {
        let mut sheets = self.sheets.write();
        if sheets.contains_key(sheet) {
            return Err(TabularError::SheetExists(sheet.to_string()));
        }
        sheets.insert(sheet.to_string(), Grid::new());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| (*c).to_string()).collect()
    }

    fn book() -> MemoryWorkbook {
        MemoryWorkbook::new().with_sheet(
            "Input",
            vec![row(&["Group", "Group"]), row(&["A", "B"]), row(&["1", "2"])],
        )
    }

    #[test]
    fn read_pads_with_empty_cells() {
        let wb = book();
        let grid = wb.read_range("Input", Rect::new(3, 1, 2, 2)).unwrap();
        assert_eq!(grid, vec![row(&["2", ""]), row(&["", ""])]);
    }

    #[test]
    fn write_extends_sheet() {
        let wb = book();
        wb.write_range("Input", Rect::new(5, 2, 1, 1), &vec![row(&["x"])])
            .unwrap();
        assert_eq!(wb.last_row("Input").unwrap(), 5);
        assert_eq!(wb.column_count("Input").unwrap(), 3);
        assert_eq!(wb.read_row("Input", 5).unwrap(), row(&["", "", "x"]));
    }

    #[test]
    fn write_rejects_shape_mismatch() {
        let wb = book();
        let err = wb
            .write_range("Input", Rect::row(3, 3), &vec![row(&["a"])])
            .unwrap_err();
        assert!(matches!(err, TabularError::ShapeMismatch { .. }));
    }

    #[test]
    fn last_row_ignores_blank_tail() {
        let wb = book();
        wb.write_row("Input", 6, &row(&["", ""])).unwrap();
        assert_eq!(wb.last_row("Input").unwrap(), 3);
        assert_eq!(wb.append_row("Input", &row(&["3", "4"])).unwrap(), 4);
    }

    #[test]
    fn append_columns_shifts_cells() {
        let wb = book();
        wb.append_columns("Input", 1, 1).unwrap();
        assert_eq!(wb.read_row("Input", 2).unwrap(), row(&["A", "", "B"]));
    }

    #[test]
    fn read_column_from_data_row() {
        let wb = book();
        wb.append_row("Input", &row(&["5", "6"])).unwrap();
        assert_eq!(wb.read_column("Input", 1, 3).unwrap(), row(&["2", "6"]));
    }

    #[test]
    fn unknown_sheet_and_zero_row() {
        let wb = book();
        assert!(matches!(
            wb.last_row("Missing"),
            Err(TabularError::SheetNotFound(_))
        ));
        assert!(matches!(
            wb.read_range("Input", Rect::new(0, 0, 1, 1)),
            Err(TabularError::InvalidRange { .. })
        ));
    }
}
