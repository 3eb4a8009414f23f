//! Export trigger API and per-attempt job processing.
//!
//! Job-triggering and schedule-management operations sit behind the
//! authorization gate; scheduled firings come in through [`JobSink`] with a
//! system context and skip the gate, since they never cross the HTTP surface.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{AuthContext, HttpMethod};
use crate::domains::export::orchestrator::{
    CancelFlag, ExportOrchestrator, ProgressCallback,
};
use crate::domains::export::repository::ExportJobRepository;
use crate::domains::export::types::{
    ExportError, ExportErrorInfo, ExportFormat, ExportJob, ExportOutcome, ExportRequest,
    ExportStatus, SourceQuery,
};
use crate::domains::queue::manager::JobQueue;
use crate::domains::queue::types::{JobDescriptor, JobPriority, JobProcessor, RetryPolicy};
use crate::domains::schedule::cron::CronSchedule;
use crate::domains::schedule::repository::ScheduleRepository;
use crate::domains::schedule::trigger::JobSink;
use crate::domains::schedule::types::{ExportSchedule, NewSchedule};
use crate::errors::{DomainError, ServiceResult};

/// Job status as reported to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub status: ExportStatus,
    pub progress: u8,
    pub attempts: u32,
    pub result: Option<ExportOutcome>,
    pub error: Option<ExportErrorInfo>,
}

impl From<&ExportJob> for JobStatusView {
    fn from(job: &ExportJob) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            progress: job.progress,
            attempts: job.attempts,
            result: job.result.clone(),
            error: job.error.clone(),
        }
    }
}

pub struct ExportService {
    jobs: Arc<dyn ExportJobRepository>,
    schedules: Arc<dyn ScheduleRepository>,
    queue: Arc<JobQueue>,
    orchestrator: Arc<ExportOrchestrator>,
    retry: RetryPolicy,
}

impl ExportService {
    pub fn new(
        jobs: Arc<dyn ExportJobRepository>,
        schedules: Arc<dyn ScheduleRepository>,
        queue: Arc<JobQueue>,
        orchestrator: Arc<ExportOrchestrator>,
        retry: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            jobs,
            schedules,
            queue,
            orchestrator,
            retry,
        })
    }

    /// Trigger an export job. Requires WRITE scope (POST-class operation).
    pub async fn create_export_job(
        &self,
        auth: &AuthContext,
        format: ExportFormat,
        query: SourceQuery,
    ) -> ServiceResult<Uuid> {
        auth.authorize_method(HttpMethod::Post)?;
        let request = ExportRequest {
            customer_id: auth.customer_id(),
            format,
            query,
        };
        self.submit(request, JobPriority::Normal).await
    }

    pub async fn get_job_status(
        &self,
        auth: &AuthContext,
        job_id: Uuid,
    ) -> ServiceResult<JobStatusView> {
        auth.authorize_method(HttpMethod::Get)?;
        let job = self.jobs.find_by_id(job_id).await?;
        auth.authorize_customer(job.customer_id)?;
        Ok(JobStatusView::from(&job))
    }

    pub async fn cancel_job(&self, auth: &AuthContext, job_id: Uuid) -> ServiceResult<()> {
        auth.authorize_method(HttpMethod::Post)?;
        let job = self.jobs.find_by_id(job_id).await?;
        auth.authorize_customer(job.customer_id)?;
        self.queue.cancel(job_id).await;
        Ok(())
    }

    pub async fn create_schedule(
        &self,
        auth: &AuthContext,
        new: NewSchedule,
    ) -> ServiceResult<Uuid> {
        auth.authorize_method(HttpMethod::Post)?;
        if new.name.trim().is_empty() {
            return Err(DomainError::Validation("schedule name is required".to_string()).into());
        }
        let cron = CronSchedule::parse(&new.cron_expr)?;
        let now = Utc::now();
        let schedule = ExportSchedule {
            id: Uuid::new_v4(),
            customer_id: auth.customer_id(),
            name: new.name,
            cron_expr: new.cron_expr,
            template: new.template,
            is_active: true,
            last_run_at: None,
            next_run_at: cron.next_after(now),
            created_at: now,
            updated_at: now,
        };
        self.schedules.create(&schedule).await?;
        debug!(
            "schedule {} created, first run at {:?}",
            schedule.id, schedule.next_run_at
        );
        Ok(schedule.id)
    }

    pub async fn list_schedules(&self, auth: &AuthContext) -> ServiceResult<Vec<ExportSchedule>> {
        auth.authorize_method(HttpMethod::Get)?;
        Ok(self.schedules.list_for_customer(auth.customer_id()).await?)
    }

    pub async fn set_schedule_active(
        &self,
        auth: &AuthContext,
        schedule_id: Uuid,
        active: bool,
    ) -> ServiceResult<()> {
        auth.authorize_method(HttpMethod::Post)?;
        let schedule = self.schedules.find_by_id(schedule_id).await?;
        auth.authorize_customer(schedule.customer_id)?;
        Ok(self
            .schedules
            .set_active(schedule_id, active, Utc::now())
            .await?)
    }

    /// Destructive; requires ADMIN scope (DELETE-class operation).
    pub async fn delete_schedule(
        &self,
        auth: &AuthContext,
        schedule_id: Uuid,
    ) -> ServiceResult<()> {
        auth.authorize_method(HttpMethod::Delete)?;
        let schedule = self.schedules.find_by_id(schedule_id).await?;
        auth.authorize_customer(schedule.customer_id)?;
        Ok(self.schedules.delete(schedule_id).await?)
    }

    async fn submit(&self, request: ExportRequest, priority: JobPriority) -> ServiceResult<Uuid> {
        if request.query.collection.trim().is_empty() {
            return Err(
                DomainError::Validation("source collection is required".to_string()).into(),
            );
        }
        let job = ExportJob::new(&request, Utc::now());
        self.jobs.create_job(&job).await?;
        let descriptor = JobDescriptor {
            id: job.id,
            request,
            priority,
            retry: self.retry.clone(),
            enqueued_at: Utc::now(),
        };
        self.queue.enqueue(descriptor).await?;
        Ok(job.id)
    }
}

#[async_trait]
impl JobProcessor for ExportService {
    async fn process(
        &self,
        job: &JobDescriptor,
        _attempt: u32,
        cancel: CancelFlag,
    ) -> Result<ExportOutcome, ExportError> {
        let record = self
            .jobs
            .find_by_id(job.id)
            .await
            .map_err(|e| ExportError::Internal(format!("job record unavailable: {}", e)))?;

        // Persist throttled progress as it is reported. Writes race benignly:
        // the repository keeps the maximum seen within the attempt.
        let jobs = self.jobs.clone();
        let job_id = job.id;
        let on_progress: ProgressCallback = Arc::new(move |update| {
            if let Some(percent) = update.percent {
                let jobs = jobs.clone();
                tokio::spawn(async move {
                    if let Err(e) = jobs.update_progress(job_id, percent).await {
                        warn!("persisting progress for job {} failed: {}", job_id, e);
                    }
                });
            }
        });

        self.orchestrator.run(&record, cancel, on_progress).await
    }
}

#[async_trait]
impl JobSink for ExportService {
    async fn submit(
        &self,
        request: ExportRequest,
        priority: JobPriority,
    ) -> ServiceResult<Uuid> {
        ExportService::submit(self, request, priority).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::gate::{ApiKey, ApiKeyScope};
    use crate::domains::export::orchestrator::PipelineConfig;
    use crate::domains::export::repository::testing::MemoryExportJobRepository;
    use crate::domains::export::source::testing::MemoryRecordSource;
    use crate::domains::export::uploader::testing::MemoryObjectStorage;
    use crate::domains::queue::manager::QueueConfig;
    use crate::domains::queue::types::LogNotifier;
    use crate::domains::schedule::repository::testing::MemoryScheduleRepository;
    use crate::domains::schedule::types::JobTemplate;
    use std::time::Duration;

    fn auth(scope: ApiKeyScope) -> AuthContext {
        AuthContext::new(ApiKey {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            scope,
            revoked: false,
            expires_at: None,
        })
    }

    fn query() -> SourceQuery {
        SourceQuery {
            collection: "records".to_string(),
            filter: None,
            columns: None,
        }
    }

    struct World {
        service: Arc<ExportService>,
        source: Arc<MemoryRecordSource>,
        storage: Arc<MemoryObjectStorage>,
        jobs: Arc<MemoryExportJobRepository>,
    }

    fn world(records: u64) -> World {
        let source = Arc::new(MemoryRecordSource::new(records));
        let storage = Arc::new(MemoryObjectStorage::new());
        let jobs = Arc::new(MemoryExportJobRepository::new());
        let schedules = Arc::new(MemoryScheduleRepository::new());
        let orchestrator = Arc::new(ExportOrchestrator::new(
            source.clone(),
            storage.clone(),
            PipelineConfig {
                page_size: 1_000,
                chunk_size: 16 * 1024,
                channel_capacity: 4,
                part_size: 64 * 1024,
                progress_interval: Duration::from_millis(50),
                progress_every_records: 500,
                stall_timeout: Duration::from_secs(5),
                job_timeout: Duration::from_secs(60),
            },
        ));
        let queue = JobQueue::new(
            jobs.clone(),
            Arc::new(LogNotifier),
            QueueConfig {
                concurrency: 2,
                keep_completed: 100,
                keep_failed: 50,
                poll_interval: Duration::from_millis(10),
            },
        );
        let service = ExportService::new(
            jobs.clone(),
            schedules,
            queue.clone(),
            orchestrator,
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                multiplier: 2.0,
            },
        );
        queue.start(service.clone());
        World {
            service,
            source,
            storage,
            jobs,
        }
    }

    async fn wait_terminal(world: &World, auth: &AuthContext, job_id: Uuid) -> JobStatusView {
        for _ in 0..500 {
            let view = world.service.get_job_status(auth, job_id).await.unwrap();
            if view.status.is_terminal() {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached a terminal state", job_id);
    }

    #[tokio::test]
    async fn read_scope_cannot_trigger_exports() {
        let world = world(10);
        let err = world
            .service
            .create_export_job(&auth(ApiKeyScope::Read), ExportFormat::csv(), query())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::ServiceError::PermissionDenied { code, .. }
                if code == "insufficient_scope"
        ));
    }

    #[tokio::test]
    async fn triggered_job_runs_to_completion() {
        let world = world(2_500);
        let auth = auth(ApiKeyScope::Write);
        let job_id = world
            .service
            .create_export_job(&auth, ExportFormat::csv(), query())
            .await
            .unwrap();

        let view = wait_terminal(&world, &auth, job_id).await;
        assert_eq!(view.status, ExportStatus::Completed);
        assert_eq!(view.progress, 100);
        let result = view.result.unwrap();
        assert_eq!(result.record_count, 2_500);
        assert!(world.storage.object(&result.storage_key).is_some());
        assert_eq!(world.jobs.len(), 1);
    }

    #[tokio::test]
    async fn job_recovers_on_the_third_attempt() {
        let world = world(100);
        // First two attempts cannot even open a cursor; the third succeeds.
        *world.source.fail_whole_attempts.lock().await = vec![true, true, false];

        let auth = auth(ApiKeyScope::Write);
        let job_id = world
            .service
            .create_export_job(&auth, ExportFormat::csv(), query())
            .await
            .unwrap();

        let view = wait_terminal(&world, &auth, job_id).await;
        assert_eq!(view.status, ExportStatus::Completed);
        assert_eq!(view.attempts, 3);
    }

    #[tokio::test]
    async fn persistent_failure_exhausts_all_attempts() {
        let world = world(100);
        *world.source.fail_whole_attempts.lock().await = vec![true, true, true];

        let auth = auth(ApiKeyScope::Write);
        let job_id = world
            .service
            .create_export_job(&auth, ExportFormat::csv(), query())
            .await
            .unwrap();

        let view = wait_terminal(&world, &auth, job_id).await;
        assert_eq!(view.status, ExportStatus::Failed);
        assert_eq!(view.attempts, 3);
        assert_eq!(view.error.unwrap().kind, "source_unavailable");
    }

    #[tokio::test]
    async fn job_status_is_scoped_to_the_owning_customer() {
        let world = world(10);
        let owner = auth(ApiKeyScope::Write);
        let job_id = world
            .service
            .create_export_job(&owner, ExportFormat::csv(), query())
            .await
            .unwrap();
        wait_terminal(&world, &owner, job_id).await;

        let stranger = auth(ApiKeyScope::Read);
        let err = world
            .service
            .get_job_status(&stranger, job_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::ServiceError::PermissionDenied { .. }
        ));
    }

    #[tokio::test]
    async fn schedule_management_respects_scopes() {
        let world = world(10);
        let writer = auth(ApiKeyScope::Write);
        let schedule_id = world
            .service
            .create_schedule(
                &writer,
                NewSchedule {
                    name: "nightly".to_string(),
                    cron_expr: "0 2 * * *".to_string(),
                    template: JobTemplate {
                        format: ExportFormat::csv(),
                        query: query(),
                        priority: JobPriority::Normal,
                    },
                },
            )
            .await
            .unwrap();

        let listed = world.service.list_schedules(&writer).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].next_run_at.unwrap() > Utc::now());

        // WRITE may toggle but not delete.
        world
            .service
            .set_schedule_active(&writer, schedule_id, false)
            .await
            .unwrap();
        let err = world
            .service
            .delete_schedule(&writer, schedule_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::ServiceError::PermissionDenied { .. }
        ));
    }

    #[tokio::test]
    async fn invalid_cron_expressions_are_rejected_at_creation() {
        let world = world(10);
        let err = world
            .service
            .create_schedule(
                &auth(ApiKeyScope::Write),
                NewSchedule {
                    name: "broken".to_string(),
                    cron_expr: "every day at noon".to_string(),
                    template: JobTemplate {
                        format: ExportFormat::csv(),
                        query: query(),
                        priority: JobPriority::Normal,
                    },
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::errors::ServiceError::Domain(DomainError::InvalidCron { .. })
        ));
    }
}
