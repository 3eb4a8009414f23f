//! JSON-lines encoder: one canonical JSON object per row.

use serde_json::{Map, Number, Value};

use crate::domains::export::types::{CellValue, ExportError, Row};
use crate::domains::export::writers::RowEncoder;

pub struct JsonLinesEncoder {
    out: Vec<u8>,
}

impl JsonLinesEncoder {
    pub fn new() -> Self {
        Self { out: Vec::new() }
    }
}

impl Default for JsonLinesEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn json_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Text(s) => Value::String(s.clone()),
        CellValue::Number(n) => Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Empty => Value::Null,
    }
}

impl RowEncoder for JsonLinesEncoder {
    fn encode_row(&mut self, row: &Row) -> Result<(), ExportError> {
        let mut object = Map::new();
        for (name, cell) in &row.cells {
            object.insert(name.clone(), json_value(cell));
        }
        let line = serde_json::to_string(&Value::Object(object))
            .map_err(|e| ExportError::Encoding(e.to_string()))?;
        self.out.extend_from_slice(line.as_bytes());
        self.out.push(b'\n');
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ExportError> {
        Ok(())
    }

    fn buffered_len(&self) -> usize {
        self.out.len()
    }

    fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}
