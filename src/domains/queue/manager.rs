//! Durable work queue with a bounded worker pool.
//!
//! Claiming is a single pop under the queue lock, so no two workers ever hold
//! the same job instance. A failed attempt with budget left is re-inserted
//! with a backoff-delayed ready time and stays logically QUEUED; exhausted or
//! non-retryable failures go to FAILED with the last error attached.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;

use crate::domains::export::orchestrator::CancelFlag;
use crate::domains::export::repository::ExportJobRepository;
use crate::domains::export::types::{ExportError, ExportErrorInfo};
use crate::domains::queue::types::{
    JobDescriptor, JobHandle, JobProcessor, NotificationEvent, Notifier, QueueJobState,
};
use crate::errors::{DomainError, DomainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Jobs processed concurrently across the worker pool.
    pub concurrency: usize,
    /// Terminal job records kept per status; older ones are pruned.
    pub keep_completed: usize,
    pub keep_failed: usize,
    /// Dispatcher idle sleep when nothing is ready.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            keep_completed: 100,
            keep_failed: 50,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub active: usize,
    pub capacity: usize,
}

struct QueueEntry {
    descriptor: JobDescriptor,
    attempts_made: u32,
    ready_at: Instant,
}

pub struct JobQueue {
    config: QueueConfig,
    repo: Arc<dyn ExportJobRepository>,
    notifier: Arc<dyn Notifier>,
    queue: Mutex<Vec<QueueEntry>>,
    statuses: Mutex<HashMap<Uuid, watch::Sender<QueueJobState>>>,
    cancels: Mutex<HashMap<Uuid, CancelFlag>>,
    active: AtomicUsize,
    semaphore: Arc<Semaphore>,
    started: AtomicBool,
}

impl JobQueue {
    pub fn new(
        repo: Arc<dyn ExportJobRepository>,
        notifier: Arc<dyn Notifier>,
        config: QueueConfig,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Arc::new(Self {
            config,
            repo,
            notifier,
            queue: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            semaphore,
            started: AtomicBool::new(false),
        })
    }

    /// Add a job; it is picked up once [`start`](Self::start) has run.
    pub async fn enqueue(&self, descriptor: JobDescriptor) -> DomainResult<JobHandle> {
        let id = descriptor.id;
        let (tx, rx) = watch::channel(QueueJobState::Queued);
        {
            let mut statuses = self.statuses.lock().await;
            if statuses.contains_key(&id) {
                return Err(DomainError::Validation(format!(
                    "job {} is already queued",
                    id
                )));
            }
            statuses.insert(id, tx);
        }
        self.cancels.lock().await.insert(id, CancelFlag::new());
        self.insert_entry(QueueEntry {
            descriptor,
            attempts_made: 0,
            ready_at: Instant::now(),
        })
        .await;
        debug!("job {} enqueued", id);
        Ok(JobHandle { id, receiver: rx })
    }

    async fn insert_entry(&self, entry: QueueEntry) {
        let mut queue = self.queue.lock().await;
        // Higher priority first; FIFO within a priority class.
        let position = queue
            .iter()
            .position(|e| e.descriptor.priority < entry.descriptor.priority)
            .unwrap_or(queue.len());
        queue.insert(position, entry);
    }

    /// Claim the highest-priority entry whose backoff delay has elapsed.
    async fn pop_ready(&self) -> Option<QueueEntry> {
        let mut queue = self.queue.lock().await;
        let now = Instant::now();
        let index = queue.iter().position(|e| e.ready_at <= now)?;
        Some(queue.remove(index))
    }

    /// Mark a job for cancellation. Pending jobs fail immediately; a running
    /// job observes the flag at its next stage boundary.
    pub async fn cancel(&self, id: Uuid) {
        let removed = {
            let mut queue = self.queue.lock().await;
            match queue.iter().position(|e| e.descriptor.id == id) {
                Some(index) => Some(queue.remove(index)),
                None => None,
            }
        };
        if let Some(entry) = removed {
            self.finish_failed(&entry.descriptor, &ExportError::Cancelled)
                .await;
            return;
        }
        if let Some(flag) = self.cancels.lock().await.get(&id) {
            flag.cancel();
            info!("cancellation requested for running job {}", id);
        }
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            queued: self.queue.lock().await.len(),
            active: self.active.load(Ordering::Relaxed),
            capacity: self.config.concurrency,
        }
    }

    /// Spawn the dispatcher loop. Idempotent.
    pub fn start(self: &Arc<Self>, processor: Arc<dyn JobProcessor>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            queue.dispatch_loop(processor).await;
        });
    }

    /// Stop claiming new jobs. Running attempts finish on their own.
    pub fn shutdown(&self) {
        self.semaphore.close();
    }

    async fn dispatch_loop(self: Arc<Self>, processor: Arc<dyn JobProcessor>) {
        info!(
            "job queue dispatcher started (concurrency {})",
            self.config.concurrency
        );
        loop {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // shut down
            };
            let Some(entry) = self.pop_ready().await else {
                drop(permit);
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            };

            let queue = self.clone();
            let processor = processor.clone();
            queue.active.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                queue.run_attempt(processor, entry).await;
                queue.active.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }
        info!("job queue dispatcher stopped");
    }

    async fn run_attempt(&self, processor: Arc<dyn JobProcessor>, mut entry: QueueEntry) {
        entry.attempts_made += 1;
        let attempt = entry.attempts_made;
        let descriptor = entry.descriptor.clone();
        let id = descriptor.id;

        self.set_state(id, QueueJobState::Processing).await;
        if let Err(e) = self.repo.mark_processing(id, attempt).await {
            error!("failed to persist PROCESSING for job {}: {}", id, e);
        }
        let cancel = self
            .cancels
            .lock()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();

        debug!(
            "job {} attempt {}/{} starting",
            id, attempt, descriptor.retry.max_attempts
        );
        match processor.process(&descriptor, attempt, cancel).await {
            Ok(outcome) => {
                if let Err(e) = self.repo.mark_completed(id, &outcome, Utc::now()).await {
                    error!("failed to persist COMPLETED for job {}: {}", id, e);
                }
                info!(
                    "job {} completed on attempt {}: {} records, {} bytes",
                    id, attempt, outcome.record_count, outcome.total_bytes
                );
                self.finish_state(id, QueueJobState::Completed(outcome.clone()))
                    .await;
                self.cancels.lock().await.remove(&id);
                self.notifier
                    .notify(NotificationEvent::ExportCompleted {
                        customer_id: descriptor.request.customer_id,
                        job_id: id,
                        result: outcome,
                    })
                    .await;
                self.prune().await;
            }
            Err(err) if err.is_retryable() && attempt < descriptor.retry.max_attempts => {
                let delay = descriptor.retry.delay_after(attempt);
                warn!(
                    "job {} attempt {}/{} failed ({}); retrying in {:?}",
                    id, attempt, descriptor.retry.max_attempts, err, delay
                );
                if let Err(e) = self.repo.mark_queued(id).await {
                    error!("failed to persist QUEUED for job {}: {}", id, e);
                }
                self.set_state(id, QueueJobState::Queued).await;
                entry.ready_at = Instant::now() + delay;
                self.insert_entry(entry).await;
            }
            Err(err) => {
                self.finish_failed(&descriptor, &err).await;
            }
        }
    }

    async fn finish_failed(&self, descriptor: &JobDescriptor, err: &ExportError) {
        let id = descriptor.id;
        let info = ExportErrorInfo::from(err);
        if let Err(e) = self.repo.mark_failed(id, &info, Utc::now()).await {
            error!("failed to persist FAILED for job {}: {}", id, e);
        }
        warn!("job {} failed terminally: {}", id, err);
        self.finish_state(id, QueueJobState::Failed(info.clone())).await;
        self.cancels.lock().await.remove(&id);
        self.notifier
            .notify(NotificationEvent::ExportFailed {
                customer_id: descriptor.request.customer_id,
                job_id: id,
                error: info,
            })
            .await;
        self.prune().await;
    }

    async fn set_state(&self, id: Uuid, state: QueueJobState) {
        if let Some(tx) = self.statuses.lock().await.get(&id) {
            let _ = tx.send(state);
        }
    }

    /// Publish a terminal state and release the status channel; handles keep
    /// observing the final value.
    async fn finish_state(&self, id: Uuid, state: QueueJobState) {
        if let Some(tx) = self.statuses.lock().await.remove(&id) {
            let _ = tx.send(state);
        }
    }

    async fn prune(&self) {
        match self
            .repo
            .prune_terminal(self.config.keep_completed, self.config.keep_failed)
            .await
        {
            Ok(0) => {}
            Ok(n) => debug!("pruned {} terminal job records", n),
            Err(e) => warn!("terminal job pruning failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::repository::testing::MemoryExportJobRepository;
    use crate::domains::export::types::{
        ExportFormat, ExportJob, ExportOutcome, ExportRequest, ExportStatus, SourceQuery,
    };
    use crate::domains::queue::types::{JobPriority, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    fn request() -> ExportRequest {
        ExportRequest {
            customer_id: Uuid::new_v4(),
            format: ExportFormat::csv(),
            query: SourceQuery {
                collection: "records".to_string(),
                filter: None,
                columns: None,
            },
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
        }
    }

    fn descriptor(request: &ExportRequest, job: &ExportJob) -> JobDescriptor {
        JobDescriptor {
            id: job.id,
            request: request.clone(),
            priority: JobPriority::Normal,
            retry: fast_retry(),
            enqueued_at: Utc::now(),
        }
    }

    /// Processor that replays a scripted sequence of per-attempt results.
    struct ScriptedProcessor {
        script: StdMutex<Vec<Result<ExportOutcome, ExportError>>>,
        processed: StdMutex<Vec<(Uuid, u32)>>,
    }

    impl ScriptedProcessor {
        fn new(script: Vec<Result<ExportOutcome, ExportError>>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script),
                processed: StdMutex::new(Vec::new()),
            })
        }

        fn outcome() -> ExportOutcome {
            ExportOutcome {
                storage_key: "exports/x.csv".to_string(),
                total_bytes: 10,
                record_count: 3,
            }
        }
    }

    #[async_trait]
    impl JobProcessor for ScriptedProcessor {
        async fn process(
            &self,
            job: &JobDescriptor,
            attempt: u32,
            _cancel: CancelFlag,
        ) -> Result<ExportOutcome, ExportError> {
            self.processed.lock().unwrap().push((job.id, attempt));
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(Self::outcome())
            } else {
                script.remove(0)
            }
        }
    }

    #[derive(Default)]
    struct CapturingNotifier {
        events: StdMutex<Vec<NotificationEvent>>,
    }

    #[async_trait]
    impl Notifier for CapturingNotifier {
        async fn notify(&self, event: NotificationEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        repo: Arc<MemoryExportJobRepository>,
        notifier: Arc<CapturingNotifier>,
        queue: Arc<JobQueue>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemoryExportJobRepository::new());
        let notifier = Arc::new(CapturingNotifier::default());
        let queue = JobQueue::new(
            repo.clone(),
            notifier.clone(),
            QueueConfig {
                concurrency: 2,
                keep_completed: 100,
                keep_failed: 50,
                poll_interval: Duration::from_millis(10),
            },
        );
        Harness {
            repo,
            notifier,
            queue,
        }
    }

    async fn seed_job(h: &Harness) -> (ExportRequest, ExportJob) {
        let request = request();
        let job = ExportJob::new(&request, Utc::now());
        h.repo.create_job(&job).await.unwrap();
        (request, job)
    }

    #[tokio::test]
    async fn successful_job_reaches_completed() {
        let h = harness();
        let (request, job) = seed_job(&h).await;
        let processor = ScriptedProcessor::new(vec![Ok(ScriptedProcessor::outcome())]);
        h.queue.start(processor);

        let mut handle = h.queue.enqueue(descriptor(&request, &job)).await.unwrap();
        let state = handle.wait_for_terminal().await;
        assert!(matches!(state, QueueJobState::Completed(_)));

        let stored = h.repo.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Completed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.result.is_some());

        let events = h.notifier.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [NotificationEvent::ExportCompleted { .. }]
        ));
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let h = harness();
        let (request, job) = seed_job(&h).await;
        let processor = ScriptedProcessor::new(vec![
            Err(ExportError::SourceUnavailable("down".to_string())),
            Err(ExportError::SourceUnavailable("still down".to_string())),
            Ok(ScriptedProcessor::outcome()),
        ]);
        h.queue.start(processor.clone());

        let mut handle = h.queue.enqueue(descriptor(&request, &job)).await.unwrap();
        let state = handle.wait_for_terminal().await;
        assert!(matches!(state, QueueJobState::Completed(_)));

        let stored = h.repo.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.status, ExportStatus::Completed);
        assert_eq!(
            processor
                .processed
                .lock()
                .unwrap()
                .iter()
                .map(|(_, a)| *a)
                .collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[tokio::test]
    async fn exhausted_attempts_reach_failed_with_last_error() {
        let h = harness();
        let (request, job) = seed_job(&h).await;
        let processor = ScriptedProcessor::new(vec![
            Err(ExportError::UploadFailed("reset 1".to_string())),
            Err(ExportError::UploadFailed("reset 2".to_string())),
            Err(ExportError::UploadFailed("reset 3".to_string())),
        ]);
        h.queue.start(processor);

        let mut handle = h.queue.enqueue(descriptor(&request, &job)).await.unwrap();
        let state = handle.wait_for_terminal().await;
        let QueueJobState::Failed(info) = state else {
            panic!("expected failed state");
        };
        assert_eq!(info.kind, "upload_failed");
        assert!(info.message.contains("reset 3"));

        let stored = h.repo.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.error.is_some());

        let events = h.notifier.events.lock().unwrap();
        assert!(matches!(
            events.as_slice(),
            [NotificationEvent::ExportFailed { .. }]
        ));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_on_first_attempt() {
        let h = harness();
        let (request, job) = seed_job(&h).await;
        let processor = ScriptedProcessor::new(vec![Err(ExportError::Encoding(
            "malformed row".to_string(),
        ))]);
        h.queue.start(processor);

        let mut handle = h.queue.enqueue(descriptor(&request, &job)).await.unwrap();
        handle.wait_for_terminal().await;

        let stored = h.repo.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Failed);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn cancelling_a_pending_job_fails_it_without_processing() {
        let h = harness();
        let (request, job) = seed_job(&h).await;
        // No start(): job stays pending.
        let mut handle = h.queue.enqueue(descriptor(&request, &job)).await.unwrap();
        h.queue.cancel(job.id).await;

        let state = handle.wait_for_terminal().await;
        let QueueJobState::Failed(info) = state else {
            panic!("expected failed state");
        };
        assert_eq!(info.kind, "cancelled");
        assert_eq!(h.queue.stats().await.queued, 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let h = harness();
        let (request, job) = seed_job(&h).await;
        h.queue.enqueue(descriptor(&request, &job)).await.unwrap();
        let err = h.queue.enqueue(descriptor(&request, &job)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn higher_priority_jobs_are_claimed_first() {
        let repo = Arc::new(MemoryExportJobRepository::new());
        // Single worker so claim order is observable.
        let queue = JobQueue::new(
            repo.clone(),
            Arc::new(CapturingNotifier::default()),
            QueueConfig {
                concurrency: 1,
                keep_completed: 100,
                keep_failed: 50,
                poll_interval: Duration::from_millis(10),
            },
        );

        let mut handles = Vec::new();
        let mut ids = Vec::new();
        for priority in [JobPriority::Low, JobPriority::Critical, JobPriority::Normal] {
            let request = request();
            let job = ExportJob::new(&request, Utc::now());
            repo.create_job(&job).await.unwrap();
            let mut d = descriptor(&request, &job);
            d.priority = priority;
            ids.push((priority, job.id));
            handles.push(queue.enqueue(d).await.unwrap());
        }

        let processor = ScriptedProcessor::new(vec![]);
        queue.start(processor.clone());
        for handle in &mut handles {
            handle.wait_for_terminal().await;
        }

        let processed = processor.processed.lock().unwrap();
        let pos = |wanted: JobPriority| {
            let id = ids.iter().find(|(p, _)| *p == wanted).unwrap().1;
            processed.iter().position(|(j, _)| *j == id).unwrap()
        };
        assert!(pos(JobPriority::Critical) < pos(JobPriority::Normal));
        assert!(pos(JobPriority::Normal) < pos(JobPriority::Low));
    }
}
