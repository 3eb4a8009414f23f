use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domains::schedule::types::ExportSchedule;
use crate::errors::{DomainError, DomainResult};

/// Durable store for recurring export definitions.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, schedule: &ExportSchedule) -> DomainResult<()>;

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ExportSchedule>;

    async fn list_for_customer(&self, customer_id: Uuid) -> DomainResult<Vec<ExportSchedule>>;

    async fn set_active(&self, id: Uuid, active: bool, updated_at: DateTime<Utc>)
        -> DomainResult<()>;

    async fn delete(&self, id: Uuid) -> DomainResult<()>;

    /// Active schedules whose `next_run_at` is due at `now`.
    async fn list_due(&self, now: DateTime<Utc>) -> DomainResult<Vec<ExportSchedule>>;

    /// Atomically claim a due schedule: compare-and-swap on `next_run_at`.
    /// The loser of a duplicate evaluation gets `ScheduleClaimConflict` and
    /// must treat the firing as a no-op.
    async fn claim_due(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        new_next_run: DateTime<Utc>,
    ) -> DomainResult<()>;
}

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: String,
    customer_id: String,
    name: String,
    cron_expr: String,
    template: String,
    is_active: i64,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn parse_uuid(s: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DomainError::InvalidUuid(e.to_string()))
}

fn parse_timestamp(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("Bad timestamp: {}", e)))
}

impl ScheduleRow {
    fn into_schedule(self) -> DomainResult<ExportSchedule> {
        Ok(ExportSchedule {
            id: parse_uuid(&self.id)?,
            customer_id: parse_uuid(&self.customer_id)?,
            name: self.name,
            cron_expr: self.cron_expr,
            template: serde_json::from_str(&self.template)
                .map_err(|e| DomainError::Internal(format!("Bad template column: {}", e)))?,
            is_active: self.is_active != 0,
            last_run_at: self.last_run_at.as_deref().map(parse_timestamp).transpose()?,
            next_run_at: self.next_run_at.as_deref().map(parse_timestamp).transpose()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    async fn create(&self, schedule: &ExportSchedule) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO export_schedules \
             (id, customer_id, name, cron_expr, template, is_active, last_run_at, next_run_at, created_at, updated_at) \
             VALUES (?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(schedule.id.to_string())
        .bind(schedule.customer_id.to_string())
        .bind(&schedule.name)
        .bind(&schedule.cron_expr)
        .bind(
            serde_json::to_string(&schedule.template)
                .map_err(|e| DomainError::Internal(e.to_string()))?,
        )
        .bind(if schedule.is_active { 1i64 } else { 0 })
        .bind(schedule.last_run_at.map(|t| t.to_rfc3339()))
        .bind(schedule.next_run_at.map(|t| t.to_rfc3339()))
        .bind(schedule.created_at.to_rfc3339())
        .bind(schedule.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> DomainResult<ExportSchedule> {
        let row: ScheduleRow = sqlx::query_as("SELECT * FROM export_schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?
            .ok_or_else(|| DomainError::EntityNotFound("ExportSchedule".to_string(), id))?;
        row.into_schedule()
    }

    async fn list_for_customer(&self, customer_id: Uuid) -> DomainResult<Vec<ExportSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT * FROM export_schedules WHERE customer_id = ? ORDER BY created_at",
        )
        .bind(customer_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    async fn set_active(
        &self,
        id: Uuid,
        active: bool,
        updated_at: DateTime<Utc>,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE export_schedules SET is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(if active { 1i64 } else { 0 })
        .bind(updated_at.to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("ExportSchedule".to_string(), id));
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> DomainResult<()> {
        let result = sqlx::query("DELETE FROM export_schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| DomainError::Database(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound("ExportSchedule".to_string(), id));
        }
        Ok(())
    }

    async fn list_due(&self, now: DateTime<Utc>) -> DomainResult<Vec<ExportSchedule>> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(
            "SELECT * FROM export_schedules \
             WHERE is_active = 1 AND next_run_at IS NOT NULL AND next_run_at <= ? \
             ORDER BY next_run_at",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    async fn claim_due(
        &self,
        id: Uuid,
        expected_next_run: DateTime<Utc>,
        fired_at: DateTime<Utc>,
        new_next_run: DateTime<Utc>,
    ) -> DomainResult<()> {
        let result = sqlx::query(
            "UPDATE export_schedules \
             SET last_run_at = ?, next_run_at = ?, updated_at = ? \
             WHERE id = ? AND is_active = 1 AND next_run_at = ?",
        )
        .bind(fired_at.to_rfc3339())
        .bind(new_next_run.to_rfc3339())
        .bind(fired_at.to_rfc3339())
        .bind(id.to_string())
        .bind(expected_next_run.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| DomainError::Database(e.into()))?;
        if result.rows_affected() == 0 {
            return Err(DomainError::ScheduleClaimConflict);
        }
        Ok(())
    }
}
