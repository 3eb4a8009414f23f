use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::domains::export::orchestrator::CancelFlag;
use crate::domains::export::types::{
    ExportError, ExportErrorInfo, ExportOutcome, ExportRequest,
};

/// Retry policy as plain data: attempts and exponential backoff, owned by the
/// queue rather than baked into a backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt after `attempts_made` failures:
    /// base, base×m, base×m², …
    pub fn delay_after(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16);
        self.base_delay
            .mul_f64(self.multiplier.powi(exponent as i32))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// Everything the queue needs to run one export job.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    /// Matches the persisted export job id.
    pub id: Uuid,
    pub request: ExportRequest,
    pub priority: JobPriority,
    pub retry: RetryPolicy,
    pub enqueued_at: DateTime<Utc>,
}

/// Observable per-job state, published on a watch channel.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueJobState {
    Queued,
    Processing,
    Completed(ExportOutcome),
    Failed(ExportErrorInfo),
}

impl QueueJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueJobState::Completed(_) | QueueJobState::Failed(_))
    }
}

/// Handle for tracking a queued job.
pub struct JobHandle {
    pub id: Uuid,
    pub(crate) receiver: watch::Receiver<QueueJobState>,
}

impl JobHandle {
    pub fn state(&self) -> QueueJobState {
        self.receiver.borrow().clone()
    }

    /// Wait until the job reaches COMPLETED or FAILED.
    pub async fn wait_for_terminal(&mut self) -> QueueJobState {
        loop {
            let current = self.receiver.borrow().clone();
            if current.is_terminal() {
                return current;
            }
            if self.receiver.changed().await.is_err() {
                return self.receiver.borrow().clone();
            }
        }
    }
}

/// Executes one attempt of a job. Implemented by the export service, which
/// wires up the orchestrator pipeline per attempt.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(
        &self,
        job: &JobDescriptor,
        attempt: u32,
        cancel: CancelFlag,
    ) -> Result<ExportOutcome, ExportError>;
}

/// Event handed to the notification subsystem on terminal job states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    ExportCompleted {
        customer_id: Uuid,
        job_id: Uuid,
        result: ExportOutcome,
    },
    ExportFailed {
        customer_id: Uuid,
        job_id: Uuid,
        error: ExportErrorInfo,
    },
}

/// Consumer of terminal-state events (email delivery lives behind this).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotificationEvent);
}

/// Default notifier: structured log line only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotificationEvent) {
        match serde_json::to_string(&event) {
            Ok(body) => info!("notification event: {}", body),
            Err(e) => info!("notification event (unserializable: {}): {:?}", e, event),
        }
    }
}
