//! Record-source boundary and the retrying cursor reader.
//!
//! The relational store behind an export is an external collaborator; this
//! module only defines the cursor/offset-pagination protocol and the reader
//! that drives it. A failed attempt restarts the whole export from offset
//! zero on the next attempt — partial progress is never resumed, because the
//! source does not guarantee a stable row ordering across attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::Stream;
use log::warn;

use crate::domains::export::types::{ExportError, RawRecord, SourceQuery};

/// Opaque cursor position handed back to the source on each page fetch.
#[derive(Debug, Clone)]
pub struct CursorHandle {
    pub token: String,
    pub offset: u64,
}

/// One fetched page of raw records.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<RawRecord>,
    pub has_more: bool,
}

/// Server-side paginated record source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn open_cursor(&self, query: &SourceQuery) -> Result<CursorHandle, ExportError>;

    /// Fetch the next page and advance the handle.
    async fn fetch_page(
        &self,
        cursor: &mut CursorHandle,
        page_size: usize,
    ) -> Result<RecordPage, ExportError>;

    /// Best-effort total count for fractional progress. `None` when the
    /// source cannot estimate cheaply.
    async fn estimate_total(&self, query: &SourceQuery) -> Result<Option<u64>, ExportError>;
}

/// Page fetches get this many tries before the attempt fails.
const PAGE_FETCH_TRIES: u32 = 3;
const PAGE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub const MIN_PAGE_SIZE: usize = 1;
pub const MAX_PAGE_SIZE: usize = 10_000;

/// Lazy, forward-only reader over a [`RecordSource`]. Never materializes the
/// result set; each `next_page` call fetches exactly one page, retrying
/// transient source faults with a short fixed backoff.
pub struct CursorReader {
    source: Arc<dyn RecordSource>,
    cursor: CursorHandle,
    page_size: usize,
    exhausted: bool,
}

impl CursorReader {
    pub async fn open(
        source: Arc<dyn RecordSource>,
        query: &SourceQuery,
        page_size: usize,
    ) -> Result<Self, ExportError> {
        let cursor = source.open_cursor(query).await?;
        Ok(Self {
            source,
            cursor,
            page_size: page_size.clamp(MIN_PAGE_SIZE, MAX_PAGE_SIZE),
            exhausted: false,
        })
    }

    /// Next page of records, or `None` once the cursor is drained.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, ExportError> {
        if self.exhausted {
            return Ok(None);
        }

        let mut last_err = None;
        for attempt in 1..=PAGE_FETCH_TRIES {
            match self.source.fetch_page(&mut self.cursor, self.page_size).await {
                Ok(page) => {
                    if !page.has_more {
                        self.exhausted = true;
                    }
                    if page.records.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(page.records));
                }
                Err(err @ ExportError::SourceUnavailable(_)) => {
                    warn!(
                        "page fetch at offset {} failed (try {}/{}): {}",
                        self.cursor.offset, attempt, PAGE_FETCH_TRIES, err
                    );
                    last_err = Some(err);
                    if attempt < PAGE_FETCH_TRIES {
                        tokio::time::sleep(PAGE_RETRY_BACKOFF).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            ExportError::SourceUnavailable("page fetch failed".to_string())
        }))
    }

    /// Consume the reader as a lazy stream of pages.
    pub fn into_page_stream(
        self,
    ) -> impl Stream<Item = Result<Vec<RawRecord>, ExportError>> + Send {
        futures::stream::try_unfold(self, |mut reader| async move {
            let page = reader.next_page().await?;
            Ok::<_, ExportError>(page.map(|records| (records, reader)))
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::Mutex;

    /// In-memory source that lazily generates `total` records and can be
    /// primed to fail a number of page fetches.
    pub struct MemoryRecordSource {
        pub total: u64,
        pub fail_fetches: AtomicU64,
        pub opened: AtomicU64,
        pub fail_whole_attempts: Mutex<Vec<bool>>,
    }

    impl MemoryRecordSource {
        pub fn new(total: u64) -> Self {
            Self {
                total,
                fail_fetches: AtomicU64::new(0),
                opened: AtomicU64::new(0),
                fail_whole_attempts: Mutex::new(Vec::new()),
            }
        }

        pub fn record(i: u64) -> RawRecord {
            let value = serde_json::json!({
                "id": i,
                "name": format!("record-{}", i),
                "active": i % 2 == 0,
            });
            value.as_object().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordSource for MemoryRecordSource {
        async fn open_cursor(&self, query: &SourceQuery) -> Result<CursorHandle, ExportError> {
            let attempt = self.opened.fetch_add(1, Ordering::SeqCst) as usize;
            let mut plan = self.fail_whole_attempts.lock().await;
            if plan.get(attempt).copied().unwrap_or(false) {
                return Err(ExportError::SourceUnavailable(
                    "source offline".to_string(),
                ));
            }
            drop(plan);
            Ok(CursorHandle {
                token: query.collection.clone(),
                offset: 0,
            })
        }

        async fn fetch_page(
            &self,
            cursor: &mut CursorHandle,
            page_size: usize,
        ) -> Result<RecordPage, ExportError> {
            if self.fail_fetches.load(Ordering::SeqCst) > 0 {
                self.fail_fetches.fetch_sub(1, Ordering::SeqCst);
                return Err(ExportError::SourceUnavailable(
                    "transient page fault".to_string(),
                ));
            }
            let start = cursor.offset;
            let end = (start + page_size as u64).min(self.total);
            let records = (start..end).map(Self::record).collect();
            cursor.offset = end;
            Ok(RecordPage {
                records,
                has_more: end < self.total,
            })
        }

        async fn estimate_total(&self, _query: &SourceQuery) -> Result<Option<u64>, ExportError> {
            Ok(Some(self.total))
        }
    }
}
