//! Rows, records and row status cells

use crate::error::GenerationError;
use crate::schema::{FieldSpec, SchemaMap};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// One schema-resolved source value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedValue {
    /// Logical field name
    pub name: String,
    /// Prompt label
    pub label: String,
    /// Cell content
    pub value: String,
}

/// A source row read through the schema map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRow {
    /// Source row number (1-based)
    pub row: usize,
    /// Values in field declaration order
    pub values: Vec<ResolvedValue>,
}

impl ResolvedRow {
    /// Pick `fields` out of a raw row using `map`
    #[must_use]
    pub fn from_cells(row: usize, cells: &[String], fields: &[FieldSpec], map: &SchemaMap) -> Self {
        let values = fields
            .iter()
            .filter_map(|spec| {
                let col = map.get(&spec.name)?;
                Some(ResolvedValue {
                    name: spec.name.clone(),
                    label: spec.display_label().to_string(),
                    value: cells.get(col).map(|c| c.trim().to_string()).unwrap_or_default(),
                })
            })
            .collect();
        Self { row, values }
    }

    /// Value of a logical field
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }

    /// Whether every resolved value is empty
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.values.iter().all(|v| v.value.is_empty())
    }

    /// Content signature over the first `max_chars` characters
    ///
    /// Identical source content yields identical signatures regardless of
    /// row position, which is what duplicate detection keys on.
    #[must_use]
    pub fn signature(&self, max_chars: usize) -> String {
        let joined = self
            .values
            .iter()
            .map(|v| v.value.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let head: String = joined.chars().take(max_chars).collect();
        let digest = Sha256::digest(head.as_bytes());
        hex::encode(&digest[..8])
    }
}

/// Structured record produced for one source row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: IndexMap<String, Value>,
}

impl Record {
    /// Build from an unwrapped model payload
    pub fn from_payload(payload: Value) -> Result<Self, GenerationError> {
        match payload {
            Value::Object(map) if !map.is_empty() => Ok(Self {
                fields: map.into_iter().collect(),
            }),
            Value::Object(_) => Err(GenerationError::InvalidPayload(
                "payload object has no fields".to_string(),
            )),
            other => Err(GenerationError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Field value
    #[inline]
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Insert or replace a field
    pub fn insert(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Fields in payload order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether a field is present with non-empty content
    #[must_use]
    pub fn has_value(&self, field: &str) -> bool {
        self.get(field).is_some_and(|v| !cell_text(v).trim().is_empty())
    }
}

/// Cell text for a JSON value: strings verbatim, null empty, others compact JSON
#[must_use]
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Outcome recorded in a sink row's status cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RowStatus {
    /// Record written
    Created,
    /// Source row had no content
    Skipped,
    /// Source content already converted
    Duplicate,
    /// Generation or validation failed
    Error(String),
}

impl RowStatus {
    /// Whether the row can be retried in place
    #[inline]
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Status cell text: `<status> | <signature>`
    #[must_use]
    pub fn cell(&self, signature: &str) -> String {
        format!("{self} | {signature}")
    }

    /// Parse a status cell into status and signature
    #[must_use]
    pub fn parse_cell(cell: &str) -> Option<(Self, Option<String>)> {
        let cell = cell.trim();
        if cell.is_empty() {
            return None;
        }
        let (status, sig) = match cell.rsplit_once(" | ") {
            Some((status, sig)) if !sig.trim().is_empty() => {
                (status.trim(), Some(sig.trim().to_string()))
            }
            _ => (cell, None),
        };
        let status = match status {
            "created" => Self::Created,
            "skipped" => Self::Skipped,
            "duplicate" => Self::Duplicate,
            other => match other.strip_prefix("error:") {
                Some(reason) => Self::Error(reason.trim().to_string()),
                None if other == "error" => Self::Error(String::new()),
                // legacy cells hold only a signature
                None => return Some((Self::Created, Some(other.to_string()))),
            },
        };
        Some((status, sig))
    }
}

impl fmt::Display for RowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Skipped => write!(f, "skipped"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Error(reason) => {
                // keep the cell parseable
                let reason = reason.replace(" | ", " / ").replace('\n', " ");
                write!(f, "error: {reason}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{resolve, HeaderSnapshot};
    use chrono::Utc;
    use serde_json::json;

    fn source_row(values: &[&str]) -> ResolvedRow {
        let fields = vec![
            FieldSpec::new("formal_info", "Formal_Info", 0),
            FieldSpec::new("html", "HTML", 1),
        ];
        let snapshot = HeaderSnapshot {
            sheet: "Input".into(),
            groups: Vec::new(),
            fields: vec!["Formal_Info".into(), "HTML".into()],
            refreshed_at: Utc::now(),
        };
        let map = resolve(&snapshot, &fields);
        let cells: Vec<String> = values.iter().map(|v| (*v).to_string()).collect();
        ResolvedRow::from_cells(7, &cells, &fields, &map)
    }

    #[test]
    fn signature_depends_on_content_not_position() {
        let a = source_row(&["chest pain", "<p>58M</p>"]);
        let mut b = source_row(&["chest pain", "<p>58M</p>"]);
        b.row = 12;
        assert_eq!(a.signature(1000), b.signature(1000));
        assert_eq!(a.signature(1000).len(), 16);
        assert_ne!(a.signature(1000), source_row(&["abdominal pain", ""]).signature(1000));
    }

    #[test]
    fn signature_only_sees_prefix() {
        let a = source_row(&["same start", "tail one"]);
        let b = source_row(&["same start", "tail two"]);
        assert_eq!(a.signature(10), b.signature(10));
        assert_ne!(a.signature(1000), b.signature(1000));
    }

    #[test]
    fn blank_detection_and_lookup() {
        assert!(source_row(&["  ", ""]).is_blank());
        let row = source_row(&["x", ""]);
        assert!(!row.is_blank());
        assert_eq!(row.get("formal_info"), Some("x"));
        assert_eq!(row.values[0].label, "Formal_Info");
    }

    #[test]
    fn payload_must_be_non_empty_object() {
        let record = Record::from_payload(json!({"Case_ID": "C1", "Vitals": {"HR": 80}})).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(cell_text(record.get("Vitals").unwrap()), r#"{"HR":80}"#);
        assert!(record.has_value("Case_ID"));

        assert!(matches!(
            Record::from_payload(json!([1, 2])),
            Err(GenerationError::InvalidPayload(_))
        ));
        assert!(matches!(
            Record::from_payload(json!({})),
            Err(GenerationError::InvalidPayload(_))
        ));
    }

    #[test]
    fn status_cells_round_trip() {
        let cell = RowStatus::Error("timeout | retry later".into()).cell("ab12");
        assert_eq!(cell, "error: timeout / retry later | ab12");
        assert_eq!(
            RowStatus::parse_cell(&cell),
            Some((
                RowStatus::Error("timeout / retry later".into()),
                Some("ab12".into())
            ))
        );
        assert_eq!(
            RowStatus::parse_cell("duplicate | ff00"),
            Some((RowStatus::Duplicate, Some("ff00".into())))
        );
        assert_eq!(
            RowStatus::parse_cell("deadbeef"),
            Some((RowStatus::Created, Some("deadbeef".into())))
        );
        assert_eq!(RowStatus::parse_cell(""), None);
    }
}
