//! Tabular store interface
//!
//! A store is a set of named sheets, each an addressable grid of strings.
//! The pipeline only ever touches sheets through this trait, so a spreadsheet
//! service, a JSON workbook on disk and the in-memory fake are interchangeable.

use crate::error::TabularError;
use crate::grid::{Grid, Rect};
use serde::{Deserialize, Serialize};

/// Result alias for tabular operations
pub type Result<T> = std::result::Result<T, TabularError>;

/// Header layout of a sheet
///
/// Conversion sheets carry a two-tier header (group row, field row), so data
/// starts on row 3. Result sheets use a single header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetLayout {
    /// Number of header rows above the first data row
    pub header_rows: usize,
}

impl SheetLayout {
    /// Two-tier header (Tier-1 group row, Tier-2 field row)
    pub const TWO_TIER: Self = Self { header_rows: 2 };

    /// Single header row
    pub const SINGLE: Self = Self { header_rows: 1 };

    /// First data row (1-based)
    #[inline]
    #[must_use]
    pub fn first_data_row(&self) -> usize {
        self.header_rows + 1
    }

    /// Row holding the fully-qualified field names
    #[inline]
    #[must_use]
    pub fn field_header_row(&self) -> usize {
        self.header_rows.max(1)
    }

    /// Number of data rows given the sheet's last non-empty row
    #[inline]
    #[must_use]
    pub fn data_rows(&self, last_row: usize) -> usize {
        last_row.saturating_sub(self.header_rows)
    }
}

impl Default for SheetLayout {
    fn default() -> Self {
        Self::TWO_TIER
    }
}

/// Addressable grid storage
pub trait TabularStore: Send + Sync {
    /// Read a block of cells; cells outside the populated area read as empty
    fn read_range(&self, sheet: &str, rect: Rect) -> Result<Grid>;

    /// Overwrite a block of cells; `values` must match `rect` exactly
    fn write_range(&self, sheet: &str, rect: Rect, values: &Grid) -> Result<()>;

    /// Insert `count` empty columns before 0-based column `position`
    fn append_columns(&self, sheet: &str, position: usize, count: usize) -> Result<()>;

    /// Last row holding any non-empty cell, 0 for an empty sheet
    fn last_row(&self, sheet: &str) -> Result<usize>;

    /// Number of columns up to the last non-empty cell in any row
    fn column_count(&self, sheet: &str) -> Result<usize>;

    /// Whether the named sheet exists
    fn sheet_exists(&self, sheet: &str) -> bool;

    /// Create an empty sheet
    fn create_sheet(&self, sheet: &str) -> Result<()>;

    /// Read one full row
    fn read_row(&self, sheet: &str, row: usize) -> Result<Vec<String>> {
        let cols = self.column_count(sheet)?;
        if cols == 0 {
            return Ok(Vec::new());
        }
        let mut grid = self.read_range(sheet, Rect::row(row, cols))?;
        Ok(grid.pop().unwrap_or_default())
    }

    /// Write `values` into `row` starting at column 0
    fn write_row(&self, sheet: &str, row: usize, values: &[String]) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        self.write_range(sheet, Rect::row(row, values.len()), &vec![values.to_vec()])
    }

    /// Append `values` after the last non-empty row, returning the row written
    fn append_row(&self, sheet: &str, values: &[String]) -> Result<usize> {
        let row = self.last_row(sheet)? + 1;
        self.write_row(sheet, row, values)?;
        Ok(row)
    }

    /// Read column `col` from `from_row` through the last row
    fn read_column(&self, sheet: &str, col: usize, from_row: usize) -> Result<Vec<String>> {
        let last = self.last_row(sheet)?;
        if last < from_row {
            return Ok(Vec::new());
        }
        let grid = self.read_range(sheet, Rect::column(col, from_row, last - from_row + 1))?;
        Ok(grid.into_iter().map(|mut r| r.pop().unwrap_or_default()).collect())
    }
}
