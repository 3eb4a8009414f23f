//! Streaming workbook (XLSX) encoder.
//!
//! An XLSX file is a ZIP container of SpreadsheetML parts. The container is
//! written in ZIP streaming mode (general-purpose bit 3, sizes and CRC in a
//! trailing data descriptor) so worksheet bytes can be handed to the uploader
//! as they are produced; the `zip` crate's writer needs `Seek`, which a
//! pipe-to-upload stream cannot provide. Entries are deflate-compressed via
//! `flate2` and cell text is written as inline strings — a shared-string
//! table would grow with the dataset.
//!
//! Sizes and offsets are written as 32-bit values; an export whose container
//! or single worksheet passes 4 GiB fails the attempt.

use std::collections::HashSet;
use std::io::Write;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

use crate::domains::export::types::{render_number, CellValue, ExportError, Row};
use crate::domains::export::writers::RowEncoder;

/// Characters Excel forbids in sheet names.
const ILLEGAL_SHEET_CHARS: [char; 7] = [':', '\\', '/', '?', '*', '[', ']'];
const MAX_SHEET_NAME_CHARS: usize = 31;
const DEFAULT_SHEET_NAME: &str = "Sheet";

/// Hard worksheet row limit in the XLSX format.
const EXCEL_MAX_ROWS: u64 = 1_048_576;

/// Compressed output is drained out of the deflater at this input granularity.
const DEFLATE_DRAIN_THRESHOLD: usize = 256 * 1024;

/// Derives unique, spreadsheet-legal sheet names. Scoped to one workbook
/// encoding session; names are compared case-insensitively.
#[derive(Debug, Default)]
pub struct SheetNamer {
    used: HashSet<String>,
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

impl SheetNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a name as taken without assigning it.
    pub fn reserve(&mut self, name: &str) {
        self.used.insert(name.to_lowercase());
    }

    /// Turn a desired name into a legal, unique sheet name and record it.
    pub fn assign(&mut self, desired: &str) -> String {
        let sanitized: String = desired
            .chars()
            .map(|c| {
                if ILLEGAL_SHEET_CHARS.contains(&c) {
                    ' '
                } else {
                    c
                }
            })
            .collect();
        let base = if sanitized.trim().is_empty() {
            DEFAULT_SHEET_NAME.to_string()
        } else {
            sanitized
        };
        let base = truncate_chars(&base, MAX_SHEET_NAME_CHARS);

        let name = if !self.used.contains(&base.to_lowercase()) {
            base
        } else {
            let mut n: u64 = 1;
            loop {
                let suffix = format!(" {}", n);
                let budget = MAX_SHEET_NAME_CHARS - suffix.chars().count();
                let candidate = format!("{}{}", truncate_chars(&base, budget), suffix);
                if !self.used.contains(&candidate.to_lowercase()) {
                    break candidate;
                }
                n += 1;
            }
        };

        self.used.insert(name.to_lowercase());
        name
    }
}

struct EntryRecord {
    name: String,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    header_offset: u64,
}

struct OpenEntry {
    name: String,
    header_offset: u64,
    deflate: DeflateEncoder<Vec<u8>>,
    crc: Crc,
    uncompressed: u64,
    compressed: u64,
    pending_input: usize,
}

pub struct XlsxEncoder {
    out: Vec<u8>,
    offset: u64,
    entries: Vec<EntryRecord>,
    namer: SheetNamer,
    sheets: Vec<String>,
    desired_name: String,
    columns: Option<Vec<String>>,
    current: Option<OpenEntry>,
    rows_in_sheet: u64,
    row_cap: u64,
    finished: bool,
}

impl XlsxEncoder {
    pub fn new(desired_sheet_name: &str, columns: Option<Vec<String>>) -> Self {
        Self {
            out: Vec::new(),
            offset: 0,
            entries: Vec::new(),
            namer: SheetNamer::new(),
            sheets: Vec::new(),
            desired_name: desired_sheet_name.to_string(),
            columns,
            current: None,
            rows_in_sheet: 0,
            row_cap: EXCEL_MAX_ROWS,
            finished: false,
        }
    }

    /// Assigned sheet names, in workbook order.
    pub fn sheet_names(&self) -> &[String] {
        &self.sheets
    }

    #[cfg(test)]
    fn set_row_cap(&mut self, cap: u64) {
        self.row_cap = cap;
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
        self.offset += bytes.len() as u64;
    }

    fn begin_entry(&mut self, name: &str) {
        let header_offset = self.offset;
        let mut header = Vec::with_capacity(30 + name.len());
        le32(0x0403_4B50, &mut header);
        le16(20, &mut header); // version needed
        le16(0x0808, &mut header); // streaming mode + UTF-8 names
        le16(8, &mut header); // deflate
        le16(0, &mut header); // mod time
        le16(0, &mut header); // mod date
        le32(0, &mut header); // crc (in descriptor)
        le32(0, &mut header); // compressed size (in descriptor)
        le32(0, &mut header); // uncompressed size (in descriptor)
        le16(name.len() as u16, &mut header);
        le16(0, &mut header); // extra
        header.extend_from_slice(name.as_bytes());
        self.emit(&header);

        self.current = Some(OpenEntry {
            name: name.to_string(),
            header_offset,
            deflate: DeflateEncoder::new(Vec::new(), Compression::default()),
            crc: Crc::new(),
            uncompressed: 0,
            compressed: 0,
            pending_input: 0,
        });
    }

    fn entry_write(&mut self, bytes: &[u8]) -> Result<(), ExportError> {
        let needs_drain = {
            let entry = self
                .current
                .as_mut()
                .ok_or_else(|| ExportError::Internal("no open container entry".to_string()))?;
            entry.crc.update(bytes);
            entry.uncompressed += bytes.len() as u64;
            entry.pending_input += bytes.len();
            entry
                .deflate
                .write_all(bytes)
                .map_err(|e| ExportError::Encoding(e.to_string()))?;
            entry.pending_input >= DEFLATE_DRAIN_THRESHOLD
        };
        if needs_drain {
            self.drain_current()?;
        }
        Ok(())
    }

    fn drain_current(&mut self) -> Result<(), ExportError> {
        let produced = {
            let entry = self
                .current
                .as_mut()
                .ok_or_else(|| ExportError::Internal("no open container entry".to_string()))?;
            entry
                .deflate
                .flush()
                .map_err(|e| ExportError::Encoding(e.to_string()))?;
            let bytes = std::mem::take(entry.deflate.get_mut());
            entry.compressed += bytes.len() as u64;
            entry.pending_input = 0;
            bytes
        };
        self.emit(&produced);
        Ok(())
    }

    fn end_entry(&mut self) -> Result<(), ExportError> {
        let entry = self
            .current
            .take()
            .ok_or_else(|| ExportError::Internal("no open container entry".to_string()))?;
        let OpenEntry {
            name,
            header_offset,
            deflate,
            crc,
            uncompressed,
            mut compressed,
            ..
        } = entry;

        let rest = deflate
            .finish()
            .map_err(|e| ExportError::Encoding(e.to_string()))?;
        compressed += rest.len() as u64;
        self.emit(&rest);

        if compressed > u32::MAX as u64 || uncompressed > u32::MAX as u64 {
            return Err(ExportError::Encoding(format!(
                "container entry '{}' exceeds the 4 GiB limit",
                name
            )));
        }

        let crc = crc.sum();
        let mut descriptor = Vec::with_capacity(16);
        le32(0x0807_4B50, &mut descriptor);
        le32(crc, &mut descriptor);
        le32(compressed as u32, &mut descriptor);
        le32(uncompressed as u32, &mut descriptor);
        self.emit(&descriptor);

        self.entries.push(EntryRecord {
            name,
            crc,
            compressed,
            uncompressed,
            header_offset,
        });
        Ok(())
    }

    fn write_simple_entry(&mut self, name: &str, content: &str) -> Result<(), ExportError> {
        self.begin_entry(name);
        self.entry_write(content.as_bytes())?;
        self.end_entry()
    }

    fn start_sheet(&mut self) -> Result<(), ExportError> {
        let name = self.namer.assign(&self.desired_name.clone());
        self.sheets.push(name);
        let part = format!("xl/worksheets/sheet{}.xml", self.sheets.len());
        self.begin_entry(&part);
        self.entry_write(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
                r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">"#,
                "<sheetData>"
            )
            .as_bytes(),
        )?;
        self.rows_in_sheet = 0;

        if let Some(columns) = self.columns.clone() {
            let header: Vec<CellValue> =
                columns.into_iter().map(CellValue::Text).collect();
            self.write_sheet_row(&header)?;
        }
        Ok(())
    }

    fn end_sheet(&mut self) -> Result<(), ExportError> {
        self.entry_write(b"</sheetData></worksheet>")?;
        self.end_entry()
    }

    fn write_sheet_row(&mut self, cells: &[CellValue]) -> Result<(), ExportError> {
        let mut xml = String::with_capacity(64 + cells.len() * 32);
        xml.push_str("<row>");
        for cell in cells {
            match cell {
                CellValue::Text(s) => {
                    xml.push_str(r#"<c t="inlineStr"><is><t xml:space="preserve">"#);
                    xml.push_str(&xml_escape(s));
                    xml.push_str("</t></is></c>");
                }
                CellValue::Number(n) => {
                    xml.push_str(r#"<c t="n"><v>"#);
                    xml.push_str(&render_number(*n));
                    xml.push_str("</v></c>");
                }
                CellValue::Bool(b) => {
                    xml.push_str(r#"<c t="b"><v>"#);
                    xml.push(if *b { '1' } else { '0' });
                    xml.push_str("</v></c>");
                }
                CellValue::Empty => xml.push_str("<c/>"),
            }
        }
        xml.push_str("</row>");
        self.rows_in_sheet += 1;
        self.entry_write(xml.as_bytes())
    }

    fn workbook_xml(&self) -> String {
        let mut xml = String::from(concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" "#,
            r#"xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
            "<sheets>"
        ));
        for (i, name) in self.sheets.iter().enumerate() {
            xml.push_str(&format!(
                r#"<sheet name="{}" sheetId="{}" r:id="rId{}"/>"#,
                xml_escape(name),
                i + 1,
                i + 1
            ));
        }
        xml.push_str("</sheets></workbook>");
        xml
    }

    fn workbook_rels(&self) -> String {
        let mut xml = String::from(concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#
        ));
        for i in 1..=self.sheets.len() {
            xml.push_str(&format!(
                concat!(
                    r#"<Relationship Id="rId{}" Type="http://schemas.openxmlformats.org/"#,
                    r#"officeDocument/2006/relationships/worksheet" Target="worksheets/sheet{}.xml"/>"#
                ),
                i, i
            ));
        }
        xml.push_str("</Relationships>");
        xml
    }

    fn content_types(&self) -> String {
        let mut xml = String::from(concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types">"#,
            r#"<Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/>"#,
            r#"<Default Extension="xml" ContentType="application/xml"/>"#,
            r#"<Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/>"#
        ));
        for i in 1..=self.sheets.len() {
            xml.push_str(&format!(
                r#"<Override PartName="/xl/worksheets/sheet{}.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/>"#,
                i
            ));
        }
        xml.push_str("</Types>");
        xml
    }

    fn write_central_directory(&mut self) -> Result<(), ExportError> {
        let cd_offset = self.offset;
        let records = std::mem::take(&mut self.entries);
        for entry in &records {
            if entry.header_offset > u32::MAX as u64 {
                return Err(ExportError::Encoding(
                    "container exceeds the 4 GiB limit".to_string(),
                ));
            }
            let mut rec = Vec::with_capacity(46 + entry.name.len());
            le32(0x0201_4B50, &mut rec);
            le16(20, &mut rec); // version made by
            le16(20, &mut rec); // version needed
            le16(0x0808, &mut rec);
            le16(8, &mut rec);
            le16(0, &mut rec); // mod time
            le16(0, &mut rec); // mod date
            le32(entry.crc, &mut rec);
            le32(entry.compressed as u32, &mut rec);
            le32(entry.uncompressed as u32, &mut rec);
            le16(entry.name.len() as u16, &mut rec);
            le16(0, &mut rec); // extra
            le16(0, &mut rec); // comment
            le16(0, &mut rec); // disk number
            le16(0, &mut rec); // internal attrs
            le32(0, &mut rec); // external attrs
            le32(entry.header_offset as u32, &mut rec);
            rec.extend_from_slice(entry.name.as_bytes());
            self.emit(&rec);
        }
        let cd_size = self.offset - cd_offset;
        if cd_offset > u32::MAX as u64 {
            return Err(ExportError::Encoding(
                "container exceeds the 4 GiB limit".to_string(),
            ));
        }

        let mut eocd = Vec::with_capacity(22);
        le32(0x0605_4B50, &mut eocd);
        le16(0, &mut eocd); // disk number
        le16(0, &mut eocd); // central directory disk
        le16(records.len() as u16, &mut eocd);
        le16(records.len() as u16, &mut eocd);
        le32(cd_size as u32, &mut eocd);
        le32(cd_offset as u32, &mut eocd);
        le16(0, &mut eocd); // comment
        self.emit(&eocd);
        Ok(())
    }
}

impl RowEncoder for XlsxEncoder {
    fn encode_row(&mut self, row: &Row) -> Result<(), ExportError> {
        if self.finished {
            return Err(ExportError::Internal(
                "encode_row after finish".to_string(),
            ));
        }
        if self.columns.is_none() {
            self.columns = Some(row.columns());
        }
        if self.current.is_none() {
            self.start_sheet()?;
        } else if self.rows_in_sheet >= self.row_cap {
            // Worksheet full: continue in an overflow sheet.
            self.end_sheet()?;
            self.start_sheet()?;
        }

        let columns = self.columns.clone().unwrap_or_default();
        let cells: Vec<CellValue> =
            columns.iter().map(|col| row.value_for(col)).collect();
        self.write_sheet_row(&cells)
    }

    fn finish(&mut self) -> Result<(), ExportError> {
        if self.finished {
            return Ok(());
        }
        if self.current.is_none() {
            // Zero-record export still yields a valid, empty workbook.
            self.start_sheet()?;
        }
        self.end_sheet()?;

        let workbook = self.workbook_xml();
        let rels = self.workbook_rels();
        let types = self.content_types();
        self.write_simple_entry("_rels/.rels", concat!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
            r#"<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships">"#,
            r#"<Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/>"#,
            "</Relationships>"
        ))?;
        self.write_simple_entry("xl/workbook.xml", &workbook)?;
        self.write_simple_entry("xl/_rels/workbook.xml.rels", &rels)?;
        self.write_simple_entry("[Content_Types].xml", &types)?;

        self.write_central_directory()?;
        self.finished = true;
        Ok(())
    }

    fn buffered_len(&self) -> usize {
        self.out.len()
    }

    fn take_buffered(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

fn le16(v: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn le32(v: u32, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn xml_escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
