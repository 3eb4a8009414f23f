//! Streaming CSV encoder.
//!
//! Header row is emitted once, from the explicit column list when one was
//! supplied and otherwise from the first record's keys. Quoting and escaping
//! are delegated to the `csv` crate; on top of that, text cells that could be
//! interpreted as formulas by spreadsheet applications are neutralized with a
//! leading single quote.

use crate::domains::export::types::{CellValue, ExportError, Row};
use crate::domains::export::writers::RowEncoder;

/// UTF-8 byte-order mark, for spreadsheet-app compatibility.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// First characters that trigger formula interpretation.
const FORMULA_PREFIXES: [char; 6] = ['=', '+', '-', '@', '\t', '\r'];

pub struct CsvEncoder {
    out: Vec<u8>,
    delimiter: u8,
    bom: bool,
    columns: Option<Vec<String>>,
    header_written: bool,
}

impl CsvEncoder {
    pub fn new(delimiter: u8, bom: bool, columns: Option<Vec<String>>) -> Self {
        Self {
            out: Vec::new(),
            delimiter,
            bom,
            columns,
            header_written: false,
        }
    }

    fn write_record(&mut self, fields: &[String]) -> Result<(), ExportError> {
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(&mut self.out);
        wtr.write_record(fields)
            .map_err(|e| ExportError::Encoding(e.to_string()))?;
        wtr.flush()
            .map_err(|e| ExportError::Encoding(e.to_string()))?;
        Ok(())
    }

    fn field_for(&self, cell: &CellValue) -> String {
        match cell {
            // Only text can smuggle a formula; typed cells render as-is, so
            // negative numbers stay parseable.
            CellValue::Text(s) => neutralize_formula(s),
            other => other.render(),
        }
    }
}

/// Prefix a single quote when the value would be treated as a formula.
fn neutralize_formula(value: &str) -> String {
    match value.chars().next() {
        Some(c) if FORMULA_PREFIXES.contains(&c) => format!("'{}", value),
        _ => value.to_string(),
    }
}

impl RowEncoder for CsvEncoder {
    fn encode_row(&mut self, row: &Row) -> Result<(), ExportError> {
        if !self.header_written {
            let columns = self.columns.clone().unwrap_or_else(|| row.columns());
            if self.bom {
                self.out.extend_from_slice(UTF8_BOM);
            }
            self.write_record(&columns)?;
            self.columns = Some(columns);
            self.header_written = true;
        }

        let columns = self.columns.as_ref().cloned().unwrap_or_default();
        let fields: Vec<String> = columns
            .iter()
            .map(|col| self.field_for(&row.value_for(col)))
            .collect();
        self.write_record(&fields)
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
