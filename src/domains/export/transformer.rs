//! Normalizes one raw record into a flat, serialization-safe row.
//!
//! Pure and position-independent: the same record always yields the same row,
//! so records can be transformed in any order and tested one at a time.

use chrono::{DateTime, SecondsFormat};
use serde_json::Value;

use crate::domains::export::types::{CellValue, RawRecord, Row};

/// Fields whose name starts with this prefix are internal and never exported.
pub const INTERNAL_FIELD_PREFIX: char = '_';

/// Transform a raw record into an ordered row of spreadsheet-safe scalars.
pub fn transform(record: &RawRecord) -> Row {
    let cells = record
        .iter()
        .filter(|(name, _)| !name.starts_with(INTERNAL_FIELD_PREFIX))
        .map(|(name, value)| (name.clone(), cell_from_value(value)))
        .collect();
    Row { cells }
}

fn cell_from_value(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::Bool(b) => CellValue::Bool(*b),
        Value::Number(n) => number_cell(n),
        Value::String(s) => string_cell(s),
        // Nested structures serialize to their canonical JSON text.
        Value::Array(_) | Value::Object(_) => {
            CellValue::Text(serde_json::to_string(value).unwrap_or_default())
        }
    }
}

fn number_cell(n: &serde_json::Number) -> CellValue {
    if let Some(f) = n.as_f64() {
        // Integers past 2^53 lose precision as f64; keep their exact text.
        if let Some(i) = n.as_i64() {
            if i.unsigned_abs() > (1u64 << 53) {
                return CellValue::Text(i.to_string());
            }
        }
        if let Some(u) = n.as_u64() {
            if u > (1u64 << 53) {
                return CellValue::Text(u.to_string());
            }
        }
        CellValue::Number(f)
    } else {
        CellValue::Text(n.to_string())
    }
}

/// Timestamp strings re-render as ISO-8601 UTC; everything else passes through.
fn string_cell(s: &str) -> CellValue {
    match DateTime::parse_from_rfc3339(s) {
        Ok(ts) => CellValue::Text(
            ts.to_utc().to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        Err(_) => CellValue::Text(s.to_string()),
    }
}
