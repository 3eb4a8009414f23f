pub mod csv_writer;
pub mod jsonl_writer;
pub mod xlsx_writer;

pub use csv_writer::CsvEncoder;
pub use jsonl_writer::JsonLinesEncoder;
pub use xlsx_writer::{SheetNamer, XlsxEncoder};

use crate::domains::export::types::{ExportError, ExportFormat, Row};

/// Streaming row encoder: rows go in, output bytes accumulate in an internal
/// buffer the pipeline drains into upload chunks. Implementations never hold
/// more than a bounded amount of buffered output.
pub trait RowEncoder: Send {
    fn encode_row(&mut self, row: &Row) -> Result<(), ExportError>;

    /// Flush trailing output (footers, container directories). Must be called
    /// exactly once, after the last row.
    fn finish(&mut self) -> Result<(), ExportError>;

    fn buffered_len(&self) -> usize;

    /// Drain the buffered output bytes.
    fn take_buffered(&mut self) -> Vec<u8>;
}

/// Build the encoder for a requested format. `columns` fixes the output
/// column order; when `None` the order comes from the first record.
pub fn encoder_for(
    format: &ExportFormat,
    columns: Option<Vec<String>>,
) -> Box<dyn RowEncoder> {
    match format {
        ExportFormat::Csv { delimiter, bom } => {
            Box::new(CsvEncoder::new(*delimiter, *bom, columns))
        }
        ExportFormat::Xlsx { sheet_name } => Box::new(XlsxEncoder::new(
            sheet_name.as_deref().unwrap_or("Sheet"),
            columns,
        )),
        ExportFormat::JsonLines => Box::new(JsonLinesEncoder::new()),
    }
}
