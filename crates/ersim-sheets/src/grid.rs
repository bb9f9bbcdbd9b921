//! Grid addressing
//!
//! Rows are 1-based (row 1 is the first header row), columns are 0-based.

use serde::{Deserialize, Serialize};

/// Row-major block of cell values
pub type Grid = Vec<Vec<String>>;

/// Rectangular range on a sheet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// First row (1-based)
    pub row: usize,
    /// First column (0-based)
    pub col: usize,
    /// Number of rows
    pub rows: usize,
    /// Number of columns
    pub cols: usize,
}

impl Rect {
    /// Create a range
    #[inline]
    #[must_use]
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Self {
        Self { row, col, rows, cols }
    }

    /// Whole row starting at column 0
    #[inline]
    #[must_use]
    pub fn row(row: usize, cols: usize) -> Self {
        Self::new(row, 0, 1, cols)
    }

    /// Single cell
    #[inline]
    #[must_use]
    pub fn cell(row: usize, col: usize) -> Self {
        Self::new(row, col, 1, 1)
    }

    /// Column segment from `row` downwards
    #[inline]
    #[must_use]
    pub fn column(col: usize, row: usize, rows: usize) -> Self {
        Self::new(row, col, rows, 1)
    }

    /// Last row covered (inclusive)
    #[inline]
    #[must_use]
    pub fn last_row(&self) -> usize {
        self.row + self.rows.saturating_sub(1)
    }

    /// Whether the range covers no cells
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Check that `values` fill this range exactly
    #[must_use]
    pub fn fits(&self, values: &Grid) -> bool {
        values.len() == self.rows && values.iter().all(|r| r.len() == self.cols)
    }
}

/// Spreadsheet-style column label (`0` -> `A`, `26` -> `AA`)
#[must_use]
pub fn column_label(mut col: usize) -> String {
    let mut label = Vec::new();
    loop {
        // col % 26 < 26, always a valid ASCII offset
        #[allow(clippy::cast_possible_truncation)]
        label.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    label.reverse();
    String::from_utf8_lossy(&label).into_owned()
}

/// Whether every cell in `row` is blank after trimming
#[inline]
#[must_use]
pub fn is_blank_row(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}
