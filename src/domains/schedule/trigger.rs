//! Cron-driven trigger: enqueues a fresh export job for every due schedule.
//!
//! A due schedule is claimed through the repository's compare-and-swap before
//! anything is enqueued, so duplicate evaluations of the same firing (two
//! trigger loops, a restart mid-tick) produce exactly one job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::domains::export::types::ExportRequest;
use crate::domains::queue::types::JobPriority;
use crate::domains::schedule::cron::CronSchedule;
use crate::domains::schedule::repository::ScheduleRepository;
use crate::domains::schedule::types::ExportSchedule;
use crate::errors::{DomainError, DomainResult, ServiceResult};

/// Where claimed firings are submitted. Implemented by the export service.
#[async_trait]
pub trait JobSink: Send + Sync {
    async fn submit(&self, request: ExportRequest, priority: JobPriority)
        -> ServiceResult<Uuid>;
}

pub struct ScheduleTrigger {
    repo: Arc<dyn ScheduleRepository>,
    sink: Arc<dyn JobSink>,
    poll_interval: Duration,
    stopped: AtomicBool,
}

impl ScheduleTrigger {
    pub fn new(
        repo: Arc<dyn ScheduleRepository>,
        sink: Arc<dyn JobSink>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repo,
            sink,
            poll_interval,
            stopped: AtomicBool::new(false),
        }
    }

    /// Spawn the polling loop.
    pub fn start(self: Arc<Self>) {
        let trigger = self;
        tokio::spawn(async move {
            info!(
                "schedule trigger started (poll interval {:?})",
                trigger.poll_interval
            );
            let mut ticker = tokio::time::interval(trigger.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if trigger.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = trigger.tick(Utc::now()).await {
                    error!("schedule trigger tick failed: {}", e);
                }
            }
            info!("schedule trigger stopped");
        });
    }

    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// One evaluation pass. Returns the number of jobs enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> DomainResult<usize> {
        let due = self.repo.list_due(now).await?;
        let mut fired = 0;
        for schedule in due {
            if self.fire(&schedule, now).await {
                fired += 1;
            }
        }
        Ok(fired)
    }

    async fn fire(&self, schedule: &ExportSchedule, now: DateTime<Utc>) -> bool {
        let Some(expected) = schedule.next_run_at else {
            return false;
        };
        let cron = match CronSchedule::parse(&schedule.cron_expr) {
            Ok(cron) => cron,
            Err(e) => {
                error!("schedule {} has an unusable cron expression: {}", schedule.id, e);
                return false;
            }
        };
        // Recompute relative to the actual fire time so a late evaluation
        // still lands on a future slot.
        let Some(new_next) = cron.next_after(now) else {
            warn!("schedule {} has no future fire time", schedule.id);
            return false;
        };

        match self
            .repo
            .claim_due(schedule.id, expected, now, new_next)
            .await
        {
            Ok(()) => {}
            Err(DomainError::ScheduleClaimConflict) => {
                debug!("schedule {} already claimed, skipping", schedule.id);
                return false;
            }
            Err(e) => {
                error!("claiming schedule {} failed: {}", schedule.id, e);
                return false;
            }
        }

        let request = ExportRequest {
            customer_id: schedule.customer_id,
            format: schedule.template.format.clone(),
            query: schedule.template.query.clone(),
        };
        match self.sink.submit(request, schedule.template.priority).await {
            Ok(job_id) => {
                info!(
                    "schedule {} ({}) fired job {}; next run {}",
                    schedule.id, schedule.name, job_id, new_next
                );
                true
            }
            Err(e) => {
                // The claim already advanced next_run_at; the firing is lost
                // rather than duplicated, consistent with at-least-once being
                // scoped to the job queue.
                error!("schedule {} claimed but enqueue failed: {}", schedule.id, e);
                false
            }
        }
    }
}
