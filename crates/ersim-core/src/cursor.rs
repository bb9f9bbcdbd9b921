//! Row cursor
//!
//! The next unprocessed source row is derived from the sink's size: every
//! attempted source row writes exactly one sink row (record or placeholder),
//! in source order, and sink rows are never deleted. So after `n` sink data
//! rows, the next source row is `source.first_data_row + n`.

use ersim_sheets::{SheetLayout, TabularStore};
use std::ops::RangeInclusive;

/// One side of the source/sink correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SheetRef<'a> {
    /// Sheet name
    pub name: &'a str,
    /// Header layout
    pub layout: SheetLayout,
}

impl<'a> SheetRef<'a> {
    /// Create a sheet reference
    #[inline]
    #[must_use]
    pub fn new(name: &'a str, layout: SheetLayout) -> Self {
        Self { name, layout }
    }
}

/// Position-correlation cursor over a source/sink pair
#[derive(Debug, Clone, Copy)]
pub struct RowCursor<'a> {
    source: SheetRef<'a>,
    sink: SheetRef<'a>,
}

impl<'a> RowCursor<'a> {
    /// Create a cursor
    #[inline]
    #[must_use]
    pub fn new(source: SheetRef<'a>, sink: SheetRef<'a>) -> Self {
        Self { source, sink }
    }

    /// Source row the next attempt must process
    pub fn expected_next_row(
        &self,
        store: &dyn TabularStore,
    ) -> ersim_sheets::tabular::Result<usize> {
        let sink_rows = self.sink.layout.data_rows(store.last_row(self.sink.name)?);
        Ok(self.source.layout.first_data_row() + sink_rows)
    }

    /// Sink row correlated with `source_row`
    #[inline]
    #[must_use]
    pub fn sink_row_for(&self, source_row: usize) -> usize {
        source_row.saturating_sub(self.source.layout.first_data_row())
            + self.sink.layout.first_data_row()
    }

    /// Up to `max_size` consecutive unprocessed source rows
    pub fn next_batch(
        &self,
        store: &dyn TabularStore,
        max_size: usize,
    ) -> ersim_sheets::tabular::Result<Vec<usize>> {
        let first = self.expected_next_row(store)?;
        let last = store.last_row(self.source.name)?;
        Ok(batch_range(first, last, max_size).collect())
    }
}

/// Rows `first..=min(last, first + max_size - 1)`, empty when exhausted
#[must_use]
#[allow(clippy::reversed_empty_ranges)]
pub fn batch_range(first: usize, last: usize, max_size: usize) -> RangeInclusive<usize> {
    if max_size == 0 || first > last {
        return 1..=0;
    }
    first..=last.min(first.saturating_add(max_size - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ersim_sheets::MemoryWorkbook;

    fn sheet(rows: usize) -> Vec<Vec<String>> {
        (1..=rows).map(|r| vec![format!("r{r}")]).collect()
    }

    fn cursor() -> RowCursor<'static> {
        RowCursor::new(
            SheetRef::new("Input", SheetLayout::TWO_TIER),
            SheetRef::new("Master", SheetLayout::TWO_TIER),
        )
    }

    #[test]
    fn twelve_sink_rows_start_at_fifteen() {
        // sink rows 3..=14 hold twelve records
        let store = MemoryWorkbook::new()
            .with_sheet("Input", sheet(30))
            .with_sheet("Master", sheet(14));
        let rows = cursor().next_batch(&store, 25).unwrap();
        assert_eq!(rows, (15..=30).collect::<Vec<_>>());
        assert_eq!(rows.len(), 16);
    }

    #[test]
    fn empty_sink_starts_at_first_data_row() {
        let store = MemoryWorkbook::new()
            .with_sheet("Input", sheet(10))
            .with_sheet("Master", sheet(2));
        assert_eq!(cursor().expected_next_row(&store).unwrap(), 3);
        assert_eq!(cursor().next_batch(&store, 3).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn exhausted_source_yields_nothing() {
        let store = MemoryWorkbook::new()
            .with_sheet("Input", sheet(10))
            .with_sheet("Master", sheet(10));
        assert!(cursor().next_batch(&store, 25).unwrap().is_empty());
    }

    #[test]
    fn correlated_sink_row_accounts_for_layouts() {
        let c = RowCursor::new(
            SheetRef::new("Input", SheetLayout::SINGLE),
            SheetRef::new("Master", SheetLayout::TWO_TIER),
        );
        assert_eq!(c.sink_row_for(2), 3);
        assert_eq!(cursor().sink_row_for(15), 15);
    }

    #[test]
    fn batch_range_edges() {
        assert_eq!(batch_range(5, 4, 10).count(), 0);
        assert_eq!(batch_range(5, 5, 10).collect::<Vec<_>>(), vec![5]);
        assert_eq!(batch_range(5, 100, 0).count(), 0);
        assert_eq!(batch_range(5, 9, usize::MAX).count(), 5);
    }
}
