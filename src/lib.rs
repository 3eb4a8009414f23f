//! Streaming bulk-export pipeline.
//!
//! Customers trigger exports of large record sets (CSV, XLSX, JSON lines)
//! which are streamed — never fully buffered — from a paginated record source
//! through a format encoder into a multi-part object-storage upload. Jobs run
//! on a retrying work queue with progress tracking; recurring exports are
//! fired by a cron schedule trigger; API-key scopes gate the trigger surface.
//!
//! The embedding application constructs an [`ExportEngine`] with its database
//! pool and implementations of the external boundaries
//! ([`RecordSource`](domains::export::RecordSource),
//! [`ObjectStorage`](domains::export::ObjectStorage),
//! [`Notifier`](domains::queue::Notifier)).

// Public modules
pub mod auth;
pub mod domains;
pub mod engine;
pub mod errors;

// Private modules
mod db_migration;

pub use auth::{ApiKey, ApiKeyScope, AuthContext, HttpMethod};
pub use domains::export::{
    ExportError, ExportFormat, ExportJob, ExportOutcome, ExportService, ExportStatus,
    JobStatusView, SourceQuery,
};
pub use domains::queue::{JobHandle, JobPriority, NotificationEvent, Notifier, RetryPolicy};
pub use domains::schedule::{ExportSchedule, NewSchedule};
pub use engine::{EngineConfig, ExportEngine};
