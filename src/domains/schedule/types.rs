use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::export::types::{ExportFormat, SourceQuery};
use crate::domains::queue::types::JobPriority;

/// Job parameters a schedule replays on every firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub format: ExportFormat,
    pub query: SourceQuery,
    #[serde(default)]
    pub priority: JobPriority,
}

/// Row mapped to the `export_schedules` table. Consumed read-only by the
/// trigger, which persists `last_run_at`/`next_run_at` through the claim
/// operation; never touched by the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSchedule {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub name: String,
    pub cron_expr: String,
    pub template: JobTemplate,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Always in the future relative to the last trigger computation.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Customer input for creating a schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
    pub name: String,
    pub cron_expr: String,
    pub template: JobTemplate,
}
