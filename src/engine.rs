//! Explicit wiring of the export pipeline.
//!
//! The embedder constructs an [`ExportEngine`] with its database pool and the
//! external collaborators (record source, object storage, notifier); there is
//! no ambient global state. Dropping the engine after `shutdown` ends the
//! background loops.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use sqlx::SqlitePool;

use crate::db_migration;
use crate::domains::export::orchestrator::{ExportOrchestrator, PipelineConfig};
use crate::domains::export::repository::{ExportJobRepository, SqliteExportJobRepository};
use crate::domains::export::service::ExportService;
use crate::domains::export::source::RecordSource;
use crate::domains::export::uploader::ObjectStorage;
use crate::domains::queue::manager::{JobQueue, QueueConfig, QueueStats};
use crate::domains::queue::types::{Notifier, RetryPolicy};
use crate::domains::schedule::repository::{ScheduleRepository, SqliteScheduleRepository};
use crate::domains::schedule::trigger::ScheduleTrigger;
use crate::errors::ServiceResult;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pipeline: PipelineConfig,
    pub queue: QueueConfig,
    pub retry: RetryPolicy,
    pub trigger_poll_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            trigger_poll_interval: Duration::from_secs(30),
        }
    }
}

pub struct ExportEngine {
    service: Arc<ExportService>,
    queue: Arc<JobQueue>,
    trigger: Arc<ScheduleTrigger>,
}

impl ExportEngine {
    /// Construct against SQLite-backed job/schedule state, applying embedded
    /// migrations first.
    pub async fn new(
        pool: SqlitePool,
        source: Arc<dyn RecordSource>,
        storage: Arc<dyn ObjectStorage>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> ServiceResult<Self> {
        db_migration::initialize_database(&pool)
            .await
            .map_err(crate::errors::DomainError::Database)
            .map_err(crate::errors::ServiceError::Domain)?;
        let jobs: Arc<dyn ExportJobRepository> =
            Arc::new(SqliteExportJobRepository::new(pool.clone()));
        let schedules: Arc<dyn ScheduleRepository> =
            Arc::new(SqliteScheduleRepository::new(pool));
        Ok(Self::assemble(jobs, schedules, source, storage, notifier, config))
    }

    /// Wire the components over caller-provided repositories and start the
    /// queue dispatcher and schedule trigger.
    pub fn assemble(
        jobs: Arc<dyn ExportJobRepository>,
        schedules: Arc<dyn ScheduleRepository>,
        source: Arc<dyn RecordSource>,
        storage: Arc<dyn ObjectStorage>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let orchestrator = Arc::new(ExportOrchestrator::new(source, storage, config.pipeline));
        let queue = JobQueue::new(jobs.clone(), notifier, config.queue);
        let service = ExportService::new(
            jobs,
            schedules.clone(),
            queue.clone(),
            orchestrator,
            config.retry,
        );
        queue.start(service.clone());
        let trigger = Arc::new(ScheduleTrigger::new(
            schedules,
            service.clone(),
            config.trigger_poll_interval,
        ));
        trigger.clone().start();
        Self {
            service,
            queue,
            trigger,
        }
    }

    pub fn service(&self) -> Arc<ExportService> {
        self.service.clone()
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Stop the trigger loop and the queue dispatcher. In-flight attempts
    /// run to completion.
    pub fn shutdown(&self) {
        self.trigger.shutdown();
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::gate::{ApiKey, ApiKeyScope};
    use crate::auth::AuthContext;
    use crate::domains::export::repository::testing::MemoryExportJobRepository;
    use crate::domains::export::source::testing::MemoryRecordSource;
    use crate::domains::export::types::{ExportFormat, ExportStatus, SourceQuery};
    use crate::domains::export::uploader::testing::MemoryObjectStorage;
    use crate::domains::queue::types::LogNotifier;
    use crate::domains::schedule::repository::testing::MemoryScheduleRepository;
    use uuid::Uuid;

    #[tokio::test]
    async fn assembled_engine_processes_a_job_end_to_end() {
        let engine = ExportEngine::assemble(
            Arc::new(MemoryExportJobRepository::new()),
            Arc::new(MemoryScheduleRepository::new()),
            Arc::new(MemoryRecordSource::new(100)),
            Arc::new(MemoryObjectStorage::new()),
            Arc::new(LogNotifier),
            EngineConfig {
                queue: QueueConfig {
                    poll_interval: Duration::from_millis(10),
                    ..QueueConfig::default()
                },
                ..EngineConfig::default()
            },
        );

        let auth = AuthContext::new(ApiKey {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            scope: ApiKeyScope::Write,
            revoked: false,
            expires_at: None,
        });
        let service = engine.service();
        let job_id = service
            .create_export_job(
                &auth,
                ExportFormat::csv(),
                SourceQuery {
                    collection: "records".to_string(),
                    filter: None,
                    columns: None,
                },
            )
            .await
            .unwrap();

        let mut terminal = None;
        for _ in 0..500 {
            let view = service.get_job_status(&auth, job_id).await.unwrap();
            if view.status.is_terminal() {
                terminal = Some(view);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let view = terminal.expect("job never finished");
        assert_eq!(view.status, ExportStatus::Completed);
        assert_eq!(view.result.unwrap().record_count, 100);

        engine.shutdown();
    }
}
