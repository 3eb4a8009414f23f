use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Export formats supported by the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExportFormat {
    Csv {
        delimiter: u8,
        /// Prefix the stream with a UTF-8 BOM so spreadsheet apps pick up
        /// the encoding.
        bom: bool,
    },
    Xlsx {
        /// Desired sheet name; sanitized and de-duplicated by the encoder.
        sheet_name: Option<String>,
    },
    JsonLines,
}

impl Default for ExportFormat {
    fn default() -> Self {
        Self::Csv {
            delimiter: b',',
            bom: true,
        }
    }
}

impl ExportFormat {
    pub fn csv() -> Self {
        Self::default()
    }

    /// Get file extension for this format
    pub fn file_extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv { .. } => "csv",
            ExportFormat::Xlsx { .. } => "xlsx",
            ExportFormat::JsonLines => "jsonl",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv { .. } => "text/csv",
            ExportFormat::Xlsx { .. } => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
            ExportFormat::JsonLines => "application/x-ndjson",
        }
    }
}

/// A raw record as produced by the record source: one JSON object per row.
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Serialization-safe scalar for one cell of a transformed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Empty,
}

impl CellValue {
    /// Plain-text rendering used by the delimited-text encoders.
    pub fn render(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => render_number(*n),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Empty => String::new(),
        }
    }
}

/// Integral values print without a trailing `.0` so round-trips stay exact.
pub(crate) fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// One transformed row: an ordered mapping from column name to scalar.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub cells: Vec<(String, CellValue)>,
}

impl Row {
    pub fn columns(&self) -> Vec<String> {
        self.cells.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Value for a column, `Empty` when the row lacks it.
    pub fn value_for(&self, column: &str) -> CellValue {
        self.cells
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v.clone())
            .unwrap_or(CellValue::Empty)
    }
}

/// Query parameters forwarded to the record source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceQuery {
    /// Source collection/table identifier.
    pub collection: String,
    /// Opaque filter forwarded to the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<serde_json::Value>,
    /// Explicit output column order; derived from the first record when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
}

/// High-level request describing what should be exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRequest {
    pub customer_id: Uuid,
    pub format: ExportFormat,
    pub query: SourceQuery,
}

/// Export job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Queued => "queued",
            ExportStatus::Processing => "processing",
            ExportStatus::Completed => "completed",
            ExportStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ExportStatus::Queued),
            "processing" => Some(ExportStatus::Processing),
            "completed" => Some(ExportStatus::Completed),
            "failed" => Some(ExportStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStatus::Completed | ExportStatus::Failed)
    }
}

/// Result attached to a COMPLETED job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOutcome {
    pub storage_key: String,
    pub total_bytes: u64,
    pub record_count: u64,
}

/// Error cause attached to a FAILED job: `{kind, message}` per the job record
/// contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&ExportError> for ExportErrorInfo {
    fn from(err: &ExportError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Row mapped to the `export_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub format: ExportFormat,
    pub query: SourceQuery,
    pub status: ExportStatus,
    /// 0..=100, non-decreasing within a single attempt.
    pub progress: u8,
    pub attempts: u32,
    pub result: Option<ExportOutcome>,
    pub error: Option<ExportErrorInfo>,
    pub requested_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn new(request: &ExportRequest, requested_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer_id: request.customer_id,
            format: request.format.clone(),
            query: request.query.clone(),
            status: ExportStatus::Queued,
            progress: 0,
            attempts: 0,
            result: None,
            error: None,
            requested_at,
            completed_at: None,
        }
    }
}

/// Pipeline error taxonomy. Retry classification drives the job queue's
/// attempt policy: transient faults re-queue, the rest fail the job outright.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ExportError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("upload failed: {0}")]
    UploadFailed(String),

    #[error("export cancelled")]
    Cancelled,

    #[error("stage made no progress: {0}")]
    Stalled(String),

    #[error("job exceeded its time budget")]
    Timeout,

    #[error("internal pipeline error: {0}")]
    Internal(String),
}

impl ExportError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::SourceUnavailable(_) => "source_unavailable",
            ExportError::Encoding(_) => "encoding_error",
            ExportError::UploadFailed(_) => "upload_failed",
            ExportError::Cancelled => "cancelled",
            ExportError::Stalled(_) => "stalled",
            ExportError::Timeout => "timeout",
            ExportError::Internal(_) => "internal",
        }
    }

    /// Whether the job queue should spend another attempt on this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::SourceUnavailable(_)
            | ExportError::UploadFailed(_)
            | ExportError::Stalled(_)
            | ExportError::Timeout => true,
            ExportError::Encoding(_) | ExportError::Cancelled | ExportError::Internal(_) => false,
        }
    }
}
