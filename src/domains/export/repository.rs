use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domains::export::types::{
    ExportErrorInfo, ExportJob, ExportOutcome, ExportStatus,
};
use crate::errors::{DomainError, DomainResult};

/// Durable store for export job lifecycle state. Lifecycle columns are only
/// written from the job queue's worker loop.
#[async_trait]
pub trait ExportJobRepository: Send + Sync {
    async fn create_job(&self, job: &ExportJob) -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ExportJob>;

    /// Claimed by a worker: PROCESSING, attempt counter bumped, progress
    /// reset for the fresh attempt.
    async fn mark_processing(&self, id: Uuid, attempt: u32) -> DomainResult<()>;

    /// Back to QUEUED between attempts.
    async fn mark_queued(&self, id: Uuid) -> DomainResult<()>;

    async fn update_progress(&self, id: Uuid, progress: u8) -> DomainResult<()>;

    async fn mark_completed(
        &self,
        id: Uuid,
        result: &ExportOutcome,
        completed_at: DateTime<Utc>,
    ) -> DomainResult<()>;

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &ExportErrorInfo,
        failed_at: DateTime<Utc>,
    ) -> DomainResult<()>;

    /// Drop terminal job records beyond the retention window. Returns the
    /// number pruned.
    async fn prune_terminal(
        &self,
        keep_completed: usize,
        keep_failed: usize,
    ) -> DomainResult<u64>;
}

pub struct SqliteExportJobRepository {
    pool: SqlitePool,
}

impl SqliteExportJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    customer_id: String,
    format: String,
    query: String,
    status: String,
    progress: i64,
    attempts: i64,
    result_key: Option<String>,
    result_bytes: Option<i64>,
    result_records: Option<i64>,
    error_kind: Option<String>,
    error_message: Option<String>,
    requested_at: String,
    completed_at: Option<String>,
}

fn parse_uuid(s: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DomainError::InvalidUuid(e.to_string()))
}

fn parse_timestamp(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("Bad timestamp: {}", e)))
}

impl JobRow {
    fn into_job(self) -> DomainResult<ExportJob> {
        let status = ExportStatus::from_str(&self.status).ok_or_else(|| {
            DomainError::Internal(format!("Invalid status {} in export_jobs", self.status))
        })?;
        let result = match (self.result_key, self.result_bytes, self.result_records) {
            (Some(storage_key), Some(total_bytes), Some(record_count)) => Some(ExportOutcome {
                storage_key,
                total_bytes: total_bytes as u64,
                record_count: record_count as u64,
            }),
            _ => None,
        };
        let error = match (self.error_kind, self.error_message) {
            (Some(kind), Some(message)) => Some(ExportErrorInfo { kind, message }),
            _ => None,
        };
        Ok(ExportJob {
            id: parse_uuid(&self.id)?,
            customer_id: parse_uuid(&self.customer_id)?,
            format: serde_json::from_str(&self.format)
                .map_err(|e| DomainError::Internal(format!("Bad format column: {}", e)))?,
            query: serde_json::from_str(&self.query)
                .map_err(|e| DomainError::Internal(format!("Bad query column: {}", e)))?,
            status,
            progress: self.progress.clamp(0, 100) as u8,
            attempts: self.attempts.max(0) as u32,
            result,
            error,
            requested_at: parse_timestamp(&self.requested_at)?,
            completed_at: self.completed_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

#[async_trait]
impl ExportJobRepository for SqliteExportJobRepository {
    async fn create_job(&self, job: &ExportJob) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO export_jobs (id, customer_id, format, query, status, progress, attempts, requested_at) \
             VALUES (?,?,?,?,?,?,?,?)",
        )
        .bind(job.id.to_string())
        .bind(job.customer_id.to_string())
        .bind(
            serde_json::to_string(&job.format)
                .map_err(|e| DomainError::Internal(e.to_string()))?,
        )
        .bind(
            serde_json::to_string(&job.query)
                .map_err(|e| DomainError::Internal(e.to_string()))?,
        )
        .bind(job.status.as_str())
        .bind(job.progress as i64)
        .bind(job.attempts as i64)
        .bind(job.requested_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ExportJob> {
        let row: JobRow = sqlx::query_as("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?
            .ok_or_else(|| DomainError::EntityNotFound("ExportJob".to_string(), id))?;
        row.into_job()
    }

    async fn mark_processing(&self, id: Uuid, attempt: u32) -> DomainResult<()> {
        sqlx::query(
            "UPDATE export_jobs SET status = ?, attempts = ?, progress = 0 WHERE id = ?",
        )
        .bind(ExportStatus::Processing.as_str())
        .bind(attempt as i64)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn mark_queued(&self, id: Uuid) -> DomainResult<()> {
        sqlx::query("UPDATE export_jobs SET status = ? WHERE id = ?")
            .bind(ExportStatus::Queued.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn update_progress(&self, id: Uuid, progress: u8) -> DomainResult<()> {
        sqlx::query(
            "UPDATE export_jobs SET progress = MAX(progress, ?) WHERE id = ? AND status = ?",
        )
        .bind(progress.min(100) as i64)
        .bind(id.to_string())
        .bind(ExportStatus::Processing.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        result: &ExportOutcome,
        completed_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            "UPDATE export_jobs SET status = ?, progress = 100, result_key = ?, result_bytes = ?, \
             result_records = ?, error_kind = NULL, error_message = NULL, completed_at = ? WHERE id = ?",
        )
        .bind(ExportStatus::Completed.as_str())
        .bind(&result.storage_key)
        .bind(result.total_bytes as i64)
        .bind(result.record_count as i64)
        .bind(completed_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        error: &ExportErrorInfo,
        failed_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        sqlx::query(
            "UPDATE export_jobs SET status = ?, error_kind = ?, error_message = ?, completed_at = ? WHERE id = ?",
        )
        .bind(ExportStatus::Failed.as_str())
        .bind(&error.kind)
        .bind(&error.message)
        .bind(failed_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn prune_terminal(
        &self,
        keep_completed: usize,
        keep_failed: usize,
    ) -> DomainResult<u64> {
        let mut pruned = 0u64;
        for (status, keep) in [
            (ExportStatus::Completed, keep_completed),
            (ExportStatus::Failed, keep_failed),
        ] {
            let result = sqlx::query(
                "DELETE FROM export_jobs WHERE status = ? AND id NOT IN \
                 (SELECT id FROM export_jobs WHERE status = ? ORDER BY completed_at DESC LIMIT ?)",
            )
            .bind(status.as_str())
            .bind(status.as_str())
            .bind(keep as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?;
            pruned += result.rows_affected();
        }
        Ok(pruned)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryExportJobRepository;
    use super::*;
    use crate::domains::export::types::{ExportFormat, ExportRequest, SourceQuery};

    fn new_job() -> ExportJob {
        ExportJob::new(
            &ExportRequest {
                customer_id: Uuid::new_v4(),
                format: ExportFormat::csv(),
                query: SourceQuery {
                    collection: "records".to_string(),
                    filter: None,
                    columns: None,
                },
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn progress_never_decreases_within_an_attempt() {
        let repo = MemoryExportJobRepository::new();
        let job = new_job();
        repo.create_job(&job).await.unwrap();
        repo.mark_processing(job.id, 1).await.unwrap();
        repo.update_progress(job.id, 40).await.unwrap();
        repo.update_progress(job.id, 20).await.unwrap();
        assert_eq!(repo.find_by_id(job.id).await.unwrap().progress, 40);
    }

    #[tokio::test]
    async fn completed_jobs_always_carry_a_result() {
        let repo = MemoryExportJobRepository::new();
        let job = new_job();
        repo.create_job(&job).await.unwrap();
        repo.mark_processing(job.id, 1).await.unwrap();
        repo.mark_completed(
            job.id,
            &ExportOutcome {
                storage_key: "exports/x.csv".to_string(),
                total_bytes: 10,
                record_count: 2,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        let stored = repo.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Completed);
        assert_eq!(stored.progress, 100);
        assert!(stored.result.is_some());
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn pruning_respects_retention_windows() {
        let repo = MemoryExportJobRepository::new();
        for i in 0..10 {
            let job = new_job();
            repo.create_job(&job).await.unwrap();
            let at = Utc::now() + chrono::Duration::seconds(i);
            if i % 2 == 0 {
                repo.mark_completed(
                    job.id,
                    &ExportOutcome {
                        storage_key: format!("exports/{}.csv", i),
                        total_bytes: 1,
                        record_count: 1,
                    },
                    at,
                )
                .await
                .unwrap();
            } else {
                repo.mark_failed(
                    job.id,
                    &ExportErrorInfo {
                        kind: "upload_failed".to_string(),
                        message: "boom".to_string(),
                    },
                    at,
                )
                .await
                .unwrap();
            }
        }
        let pruned = repo.prune_terminal(2, 1).await.unwrap();
        assert_eq!(pruned, 7);
        assert_eq!(repo.len(), 3);
    }
}
