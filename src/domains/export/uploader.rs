//! Object-storage boundary and the multi-part streaming uploader.
//!
//! The uploader drains an incrementally-produced byte stream into fixed-size
//! parts, so memory stays bounded regardless of export size. A failed upload
//! is always aborted — no partially-written object is ever left visible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, warn};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domains::export::types::ExportError;

/// One uploaded part, identified for the final completion call.
#[derive(Debug, Clone)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// S3-compatible object store, as seen by the uploader.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Begin a multi-part upload; returns the upload id.
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, ExportError>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<CompletedPart, ExportError>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), ExportError>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str)
        -> Result<(), ExportError>;
}

/// Hand-off item between the encoding stage and the uploader.
#[derive(Debug)]
pub enum UploadChunk {
    Data(Vec<u8>),
    /// Sent after the last data chunk. A channel that closes without this
    /// marker means the producer died; the upload is aborted, never
    /// committed truncated.
    Finish { record_count: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadReceipt {
    pub storage_key: String,
    pub total_bytes: u64,
    pub record_count: u64,
}

pub struct MultipartUploader {
    storage: Arc<dyn ObjectStorage>,
    part_size: usize,
    stall_timeout: Duration,
}

impl MultipartUploader {
    pub fn new(storage: Arc<dyn ObjectStorage>, part_size: usize, stall_timeout: Duration) -> Self {
        Self {
            storage,
            part_size,
            stall_timeout,
        }
    }

    pub async fn upload(
        &self,
        key: &str,
        content_type: &str,
        rx: mpsc::Receiver<UploadChunk>,
    ) -> Result<UploadReceipt, ExportError> {
        let upload_id = self
            .storage
            .initiate_multipart_upload(key, content_type)
            .await?;
        debug!("multipart upload {} started for {}", upload_id, key);

        match self.drive(key, &upload_id, rx).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                if let Err(abort_err) = self
                    .storage
                    .abort_multipart_upload(key, &upload_id)
                    .await
                {
                    error!(
                        "failed to abort multipart upload {} for {}: {}",
                        upload_id, key, abort_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        key: &str,
        upload_id: &str,
        rx: mpsc::Receiver<UploadChunk>,
    ) -> Result<UploadReceipt, ExportError> {
        let mut chunks = ReceiverStream::new(rx);
        let mut buffer: Vec<u8> = Vec::with_capacity(self.part_size);
        let mut parts: Vec<CompletedPart> = Vec::new();
        let mut total_bytes: u64 = 0;
        let record_count;

        loop {
            let chunk = tokio::time::timeout(self.stall_timeout, chunks.next())
                .await
                .map_err(|_| {
                    ExportError::Stalled("uploader received no data".to_string())
                })?;
            match chunk {
                Some(UploadChunk::Data(bytes)) => {
                    total_bytes += bytes.len() as u64;
                    buffer.extend_from_slice(&bytes);
                    while buffer.len() >= self.part_size {
                        let rest = buffer.split_off(self.part_size);
                        let part = std::mem::replace(&mut buffer, rest);
                        let number = parts.len() as u32 + 1;
                        parts.push(
                            self.storage
                                .upload_part(key, upload_id, number, part)
                                .await?,
                        );
                    }
                }
                Some(UploadChunk::Finish { record_count: n }) => {
                    record_count = n;
                    break;
                }
                None => {
                    // Producer dropped the channel mid-stream.
                    return Err(ExportError::UploadFailed(
                        "byte stream ended before completion".to_string(),
                    ));
                }
            }
        }

        // Final (possibly short, possibly empty) part: multi-part uploads
        // need at least one part to complete.
        if !buffer.is_empty() || parts.is_empty() {
            let number = parts.len() as u32 + 1;
            parts.push(
                self.storage
                    .upload_part(key, upload_id, number, buffer)
                    .await?,
            );
        }

        self.storage
            .complete_multipart_upload(key, upload_id, parts)
            .await?;
        debug!(
            "multipart upload {} completed: {} bytes, {} records",
            upload_id, total_bytes, record_count
        );
        Ok(UploadReceipt {
            storage_key: key.to_string(),
            total_bytes,
            record_count,
        })
    }
}

/// Object storage reached through an S3-compatible HTTP gateway.
pub struct ApiObjectStorage {
    client: Client,
    base_url: String,
    bucket: String,
    api_token: String,
}

#[derive(Deserialize)]
struct InitiateResponse {
    upload_id: String,
}

#[derive(Deserialize)]
struct PartResponse {
    etag: String,
}

impl ApiObjectStorage {
    pub fn new(base_url: &str, bucket: &str, api_token: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            api_token: api_token.to_string(),
        }
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, key)
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_token)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ExportError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_string());
            Err(ExportError::UploadFailed(format!(
                "storage returned {}: {}",
                status, body
            )))
        }
    }
}

#[async_trait]
impl ObjectStorage for ApiObjectStorage {
    async fn initiate_multipart_upload(
        &self,
        key: &str,
        content_type: &str,
    ) -> Result<String, ExportError> {
        let response = self
            .client
            .post(format!("{}?uploads", self.object_url(key)))
            .header("Authorization", self.auth_header())
            .header("Content-Type", content_type)
            .send()
            .await
            .map_err(|e| ExportError::UploadFailed(e.to_string()))?;
        let body: InitiateResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ExportError::UploadFailed(e.to_string()))?;
        Ok(body.upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        bytes: Vec<u8>,
    ) -> Result<CompletedPart, ExportError> {
        let response = self
            .client
            .put(format!(
                "{}?uploadId={}&partNumber={}",
                self.object_url(key),
                upload_id,
                part_number
            ))
            .header("Authorization", self.auth_header())
            .body(bytes)
            .send()
            .await
            .map_err(|e| ExportError::UploadFailed(e.to_string()))?;
        let body: PartResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ExportError::UploadFailed(e.to_string()))?;
        Ok(CompletedPart {
            part_number,
            etag: body.etag,
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), ExportError> {
        let manifest: Vec<serde_json::Value> = parts
            .iter()
            .map(|p| {
                serde_json::json!({
                    "part_number": p.part_number,
                    "etag": p.etag,
                })
            })
            .collect();
        let response = self
            .client
            .post(format!("{}?uploadId={}", self.object_url(key), upload_id))
            .header("Authorization", self.auth_header())
            .json(&serde_json::json!({ "parts": manifest }))
            .send()
            .await
            .map_err(|e| ExportError::UploadFailed(e.to_string()))?;
        Self::check(response).await?;
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ExportError> {
        let response = self
            .client
            .delete(format!("{}?uploadId={}", self.object_url(key), upload_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| ExportError::UploadFailed(e.to_string()))?;
        if !response.status().is_success() {
            warn!(
                "abort of upload {} for {} returned {}",
                upload_id,
                key,
                response.status()
            );
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryObjectStorage;
    use super::*;
    use std::sync::atomic::Ordering;

    fn uploader(storage: Arc<MemoryObjectStorage>, part_size: usize) -> MultipartUploader {
        MultipartUploader::new(storage, part_size, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn assembles_parts_in_order() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let up = uploader(storage.clone(), 4);
        let (tx, rx) = mpsc::channel(4);

        let producer = tokio::spawn(async move {
            tx.send(UploadChunk::Data(b"abcdef".to_vec())).await.unwrap();
            tx.send(UploadChunk::Data(b"ghij".to_vec())).await.unwrap();
            tx.send(UploadChunk::Finish { record_count: 2 }).await.unwrap();
        });

        let receipt = up.upload("exports/a.csv", "text/csv", rx).await.unwrap();
        producer.await.unwrap();

        assert_eq!(receipt.total_bytes, 10);
        assert_eq!(receipt.record_count, 2);
        assert_eq!(
            storage.object("exports/a.csv").unwrap(),
            b"abcdefghij".to_vec()
        );
        assert_eq!(storage.aborted_count(), 0);
    }

    #[tokio::test]
    async fn zero_byte_stream_still_completes() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let up = uploader(storage.clone(), 4);
        let (tx, rx) = mpsc::channel(1);
        tx.send(UploadChunk::Finish { record_count: 0 }).await.unwrap();
        drop(tx);

        let receipt = up.upload("exports/empty.csv", "text/csv", rx).await.unwrap();
        assert_eq!(receipt.total_bytes, 0);
        assert_eq!(storage.object("exports/empty.csv").unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn truncated_stream_aborts_instead_of_committing() {
        let storage = Arc::new(MemoryObjectStorage::new());
        let up = uploader(storage.clone(), 4);
        let (tx, rx) = mpsc::channel(1);
        tx.send(UploadChunk::Data(b"partial".to_vec())).await.unwrap();
        drop(tx); // no Finish marker

        let err = up.upload("exports/b.csv", "text/csv", rx).await.unwrap_err();
        assert!(matches!(err, ExportError::UploadFailed(_)));
        assert!(storage.object("exports/b.csv").is_none());
        assert_eq!(storage.aborted_count(), 1);
    }

    #[tokio::test]
    async fn part_failure_aborts_the_upload() {
        let storage = Arc::new(MemoryObjectStorage::new());
        storage.fail_part_uploads.store(1, Ordering::SeqCst);
        let up = uploader(storage.clone(), 2);
        let (tx, rx) = mpsc::channel(2);
        tx.send(UploadChunk::Data(b"abcd".to_vec())).await.unwrap();
        tx.send(UploadChunk::Finish { record_count: 1 }).await.unwrap();
        drop(tx);

        let err = up.upload("exports/c.csv", "text/csv", rx).await.unwrap_err();
        assert!(matches!(err, ExportError::UploadFailed(_)));
        assert_eq!(storage.aborted_count(), 1);
    }
}
