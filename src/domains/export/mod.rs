pub mod orchestrator;
pub mod repository;
pub mod service;
pub mod source;
pub mod transformer;
pub mod types;
pub mod uploader;
pub mod writers;

pub use orchestrator::{CancelFlag, ExportOrchestrator, PipelineConfig, ProgressUpdate};
pub use repository::{ExportJobRepository, SqliteExportJobRepository};
pub use service::{ExportService, JobStatusView};
pub use source::{CursorHandle, CursorReader, RecordPage, RecordSource};
pub use types::{
    ExportError, ExportFormat, ExportJob, ExportOutcome, ExportRequest, ExportStatus,
    SourceQuery,
};
pub use uploader::{ApiObjectStorage, MultipartUploader, ObjectStorage};
pub use writers::{CsvEncoder, JsonLinesEncoder, RowEncoder, SheetNamer, XlsxEncoder};
