//! Per-attempt export pipeline: cursor reader → transformer → encoder →
//! multi-part uploader.
//!
//! Reading/encoding and uploading run as two tasks joined by a bounded
//! channel; when the uploader falls behind the channel fills and the producer
//! suspends, so peak memory is a small constant multiple of one chunk plus
//! one upload part, independent of export size.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::domains::export::source::{CursorReader, RecordSource};
use crate::domains::export::transformer;
use crate::domains::export::types::{ExportError, ExportJob, ExportOutcome};
use crate::domains::export::uploader::{MultipartUploader, ObjectStorage, UploadChunk};
use crate::domains::export::writers::encoder_for;

/// Pipeline tuning knobs, all bounded-memory relevant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub page_size: usize,
    /// Bytes per encoder→uploader hand-off.
    pub chunk_size: usize,
    /// Chunks the hand-off channel may hold before the producer suspends.
    pub channel_capacity: usize,
    pub part_size: usize,
    pub progress_interval: Duration,
    pub progress_every_records: u64,
    /// A stage making no progress for this long fails the attempt.
    pub stall_timeout: Duration,
    /// Aggregate wall-clock budget for one attempt.
    pub job_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            page_size: 1_000,
            chunk_size: 256 * 1024,
            channel_capacity: 8,
            part_size: 8 * 1024 * 1024,
            progress_interval: Duration::from_millis(500),
            progress_every_records: 1_000,
            stall_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(3_600),
        }
    }
}

/// Externally-settable cancellation marker, observed at page boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub records_emitted: u64,
    /// `None` when the source could not estimate a total (indeterminate
    /// progress: the record counter still increases monotonically).
    pub percent: Option<u8>,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Rate-limits progress callbacks to once per interval or record window,
/// whichever comes first.
struct ProgressThrottle {
    estimate: Option<u64>,
    min_interval: Duration,
    every_records: u64,
    last_at: Instant,
    last_records: u64,
}

impl ProgressThrottle {
    fn new(estimate: Option<u64>, min_interval: Duration, every_records: u64) -> Self {
        Self {
            estimate,
            min_interval,
            every_records: every_records.max(1),
            last_at: Instant::now(),
            last_records: 0,
        }
    }

    fn update_for(&self, records: u64) -> ProgressUpdate {
        let percent = self
            .estimate
            .map(|total| (records * 100 / total.max(1)).min(100) as u8);
        ProgressUpdate {
            records_emitted: records,
            percent,
        }
    }

    fn on_record(&mut self, records: u64) -> Option<ProgressUpdate> {
        if records - self.last_records >= self.every_records
            || self.last_at.elapsed() >= self.min_interval
        {
            self.last_records = records;
            self.last_at = Instant::now();
            Some(self.update_for(records))
        } else {
            None
        }
    }
}

pub struct ExportOrchestrator {
    source: Arc<dyn RecordSource>,
    storage: Arc<dyn ObjectStorage>,
    config: PipelineConfig,
}

impl ExportOrchestrator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        storage: Arc<dyn ObjectStorage>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            storage,
            config,
        }
    }

    pub fn storage_key(job: &ExportJob) -> String {
        format!(
            "exports/{}/{}.{}",
            job.customer_id,
            job.id,
            job.format.file_extension()
        )
    }

    /// Execute one attempt of the given job. On any failure the in-flight
    /// upload is aborted before the error is returned.
    pub async fn run(
        &self,
        job: &ExportJob,
        cancel: CancelFlag,
        on_progress: ProgressCallback,
    ) -> Result<ExportOutcome, ExportError> {
        let key = Self::storage_key(job);
        let estimate = match self.source.estimate_total(&job.query).await {
            Ok(estimate) => estimate,
            Err(err) => {
                warn!("total estimate for job {} failed: {}", job.id, err);
                None
            }
        };

        let (tx, rx) = mpsc::channel::<UploadChunk>(self.config.channel_capacity);
        let uploader = MultipartUploader::new(
            self.storage.clone(),
            self.config.part_size,
            self.config.stall_timeout,
        );
        let content_type = job.format.content_type();
        let upload_task = {
            let key = key.clone();
            tokio::spawn(async move { uploader.upload(&key, content_type, rx).await })
        };

        let produce_result = self
            .produce(job, estimate, tx, cancel, on_progress)
            .await;
        let upload_result = upload_task
            .await
            .map_err(|e| ExportError::Internal(format!("upload task panicked: {}", e)))?;

        match (produce_result, upload_result) {
            (Ok(record_count), Ok(receipt)) => Ok(ExportOutcome {
                storage_key: receipt.storage_key,
                total_bytes: receipt.total_bytes,
                record_count,
            }),
            // Both failed: a send-side failure usually just reflects the
            // uploader dying first, so the uploader's error is the cause.
            (Err(ExportError::UploadFailed(_)), Err(upload_err)) => Err(upload_err),
            (Err(produce_err), _) => Err(produce_err),
            (Ok(_), Err(upload_err)) => Err(upload_err),
        }
    }

    async fn produce(
        &self,
        job: &ExportJob,
        estimate: Option<u64>,
        tx: mpsc::Sender<UploadChunk>,
        cancel: CancelFlag,
        on_progress: ProgressCallback,
    ) -> Result<u64, ExportError> {
        let deadline = Instant::now() + self.config.job_timeout;
        let reader =
            CursorReader::open(self.source.clone(), &job.query, self.config.page_size).await?;
        let mut pages = Box::pin(reader.into_page_stream());
        let mut encoder = encoder_for(&job.format, job.query.columns.clone());
        let mut throttle = ProgressThrottle::new(
            estimate,
            self.config.progress_interval,
            self.config.progress_every_records,
        );
        let mut records: u64 = 0;

        while let Some(page) = pages.next().await {
            let page = page?;
            // Cancellation and the wall-clock budget are checked at page
            // boundaries, never mid-record.
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(ExportError::Timeout);
            }

            for record in &page {
                let row = transformer::transform(record);
                encoder.encode_row(&row)?;
                records += 1;

                if encoder.buffered_len() >= self.config.chunk_size {
                    self.send_chunk(&tx, encoder.take_buffered()).await?;
                }
                if let Some(update) = throttle.on_record(records) {
                    on_progress(update);
                }
            }
        }

        encoder.finish()?;
        let rest = encoder.take_buffered();
        if !rest.is_empty() {
            self.send_chunk(&tx, rest).await?;
        }
        self.send(&tx, UploadChunk::Finish {
            record_count: records,
        })
        .await?;

        on_progress(throttle.update_for(records));
        Ok(records)
    }

    async fn send_chunk(
        &self,
        tx: &mpsc::Sender<UploadChunk>,
        bytes: Vec<u8>,
    ) -> Result<(), ExportError> {
        self.send(tx, UploadChunk::Data(bytes)).await
    }

    async fn send(
        &self,
        tx: &mpsc::Sender<UploadChunk>,
        chunk: UploadChunk,
    ) -> Result<(), ExportError> {
        match tokio::time::timeout(self.config.stall_timeout, tx.send(chunk)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ExportError::UploadFailed(
                "upload stage closed unexpectedly".to_string(),
            )),
            Err(_) => Err(ExportError::Stalled(
                "upload stage accepted no data".to_string(),
            )),
        }
    }
}
