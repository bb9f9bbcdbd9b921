//! Row spec parsing (`"5, 7, 10-12"`)
//!
//! The same notation is used to persist pending rows compactly: a contiguous
//! batch of any length encodes as a single range.

use crate::error::BatchError;
use std::collections::BTreeSet;

/// Largest range a single spec token may expand to
const MAX_RANGE: usize = 10_000;

/// Parse a comma-separated list of rows and inclusive ranges
///
/// Rows come back sorted and deduplicated.
pub fn parse_row_spec(spec: &str) -> Result<Vec<usize>, BatchError> {
    parse_with_limit(spec, MAX_RANGE)
}

/// Decode rows persisted with [`encode_rows`]
pub fn decode_rows(encoded: &str) -> Result<Vec<usize>, BatchError> {
    if encoded.trim().is_empty() {
        return Ok(Vec::new());
    }
    parse_with_limit(encoded, usize::MAX)
}

/// Encode ascending rows as a compact spec (`[3,4,5,9]` -> `"3-5,9"`)
#[must_use]
pub fn encode_rows(rows: &[usize]) -> String {
    let mut parts = Vec::new();
    let mut iter = rows.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}-{end}"));
        }
    }
    parts.join(",")
}

fn parse_with_limit(spec: &str, limit: usize) -> Result<Vec<usize>, BatchError> {
    let mut rows = BTreeSet::new();
    for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('-') {
            Some((start, end)) => {
                let start = parse_row(start.trim(), token)?;
                let end = parse_row(end.trim(), token)?;
                if start > end {
                    return Err(BatchError::InvalidRowSpec(format!(
                        "range '{token}' is reversed"
                    )));
                }
                if end - start >= limit {
                    return Err(BatchError::InvalidRowSpec(format!(
                        "range '{token}' exceeds {limit} rows"
                    )));
                }
                rows.extend(start..=end);
            }
            None => {
                rows.insert(parse_row(token, token)?);
            }
        }
    }
    if rows.is_empty() {
        return Err(BatchError::InvalidRowSpec("no rows given".to_string()));
    }
    Ok(rows.into_iter().collect())
}

fn parse_row(text: &str, token: &str) -> Result<usize, BatchError> {
    match text.parse::<usize>() {
        Ok(0) => Err(BatchError::InvalidRowSpec(format!(
            "row 0 in '{token}', rows are 1-based"
        ))),
        Ok(n) => Ok(n),
        Err(_) => Err(BatchError::InvalidRowSpec(format!(
            "'{token}' is not a row or range"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_rows_and_ranges() {
        assert_eq!(parse_row_spec("5, 7, 10-12").unwrap(), vec![5, 7, 10, 11, 12]);
    }

    #[test]
    fn overlap_is_deduplicated_and_sorted() {
        assert_eq!(parse_row_spec("12,10-12, 3,,").unwrap(), vec![3, 10, 11, 12]);
    }

    #[test]
    fn encoding_collapses_runs() {
        assert_eq!(encode_rows(&[3, 4, 5, 9, 11, 12]), "3-5,9,11-12");
        assert_eq!(encode_rows(&[]), "");
        assert_eq!(decode_rows("3-5,9,11-12").unwrap(), vec![3, 4, 5, 9, 11, 12]);
        assert!(decode_rows("").unwrap().is_empty());
        assert_eq!(decode_rows("1-20000").unwrap().len(), 20_000);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", " , ", "abc", "4-2", "0", "3-x", "1-20000"] {
            assert!(
                matches!(parse_row_spec(bad), Err(BatchError::InvalidRowSpec(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
