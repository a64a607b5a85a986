//! Chunked network send and file upload protocols
//!
//! Drives oversized outbound payloads through caller-injected transports.
//! The engine performs no I/O itself: a [`ChunkTransport`] or
//! [`UploadTransport`] implementation carries the actual requests, while the
//! drivers here split the payload, run the chunks on the sequential
//! scheduler path with the retry policy applied per chunk, and report
//! progress over the same channel type the batch scheduler uses.
//!
//! A chunked send tags every request with a generated request id and the
//! chunk's position, then issues one `complete` call referencing the same id
//! so the receiver can reassemble. File uploads follow the analogous
//! three-phase shape: `init` announces the file and chunk count, repeated
//! `upload_chunk` calls carry the data, `complete` finalizes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::chunk::{split_bytes, split_text, SplitOptions};
use crate::error::{BatchError, BatchResult};
use crate::progress::{ProgressSender, ProgressWatch, SharedProgress};
use crate::retry::RetryPolicy;
use crate::scheduler::{processor, CancelSignal, ScheduleConfig, Scheduler};

/// Header carrying the request id shared by every chunk of one send
pub const HEADER_REQUEST_ID: &str = "x-chunk-request-id";
/// Header carrying the chunk's zero-based index
pub const HEADER_CHUNK_INDEX: &str = "x-chunk-index";
/// Header carrying the total chunk count
pub const HEADER_CHUNK_TOTAL: &str = "x-chunk-total";

/// Identifies one chunk request within a chunked send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeaders {
    pub request_id: String,
    pub index: usize,
    pub total: usize,
}

impl ChunkHeaders {
    pub fn new(request_id: &str, index: usize, total: usize) -> Self {
        Self {
            request_id: request_id.to_string(),
            index,
            total,
        }
    }

    /// Wire representation as header name/value pairs.
    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            (HEADER_REQUEST_ID.to_string(), self.request_id.clone()),
            (HEADER_CHUNK_INDEX.to_string(), self.index.to_string()),
            (HEADER_CHUNK_TOTAL.to_string(), self.total.to_string()),
        ])
    }
}

/// Caller-injected transport for chunked sends.
///
/// Calls must be idempotent-safe: a chunk may be re-sent under retry.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Deliver one chunk of the payload.
    async fn send_chunk(&self, headers: ChunkHeaders, payload: String) -> anyhow::Result<()>;

    /// Signal the receiver that every chunk of `request_id` has been sent
    /// and the full payload can be reassembled.
    async fn complete(&self, request_id: &str, total_chunks: usize) -> anyhow::Result<()>;
}

/// What a finished chunked send looked like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub request_id: String,
    pub total_chunks: usize,
    /// Characters of payload carried across all chunks
    pub chars: usize,
}

/// Splits an oversized payload and drives it through a [`ChunkTransport`].
pub struct ChunkedSender {
    transport: Arc<dyn ChunkTransport>,
    max_chunk_size: usize,
    retry: RetryPolicy,
    chunk_delay: Duration,
    progress: SharedProgress,
    cancel: CancelSignal,
}

impl ChunkedSender {
    pub fn new(transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            transport,
            max_chunk_size: 5000,
            retry: RetryPolicy::default(),
            chunk_delay: Duration::ZERO,
            progress: Arc::new(ProgressSender::new()),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn watch_progress(&self) -> ProgressWatch {
        self.progress.subscribe()
    }

    /// Stop dispatching further chunks. A cancelled sender stays cancelled;
    /// build a new one to resume sending.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a payload as an ordered sequence of chunk requests plus one
    /// final `complete` call.
    ///
    /// A failed chunk aborts the send after its retries are exhausted; the
    /// receiver never gets a `complete` for a partial payload. An empty
    /// payload is already complete and touches the transport not at all.
    pub async fn send(&self, payload: &str) -> BatchResult<SendReceipt> {
        let chunks = split_text(payload, self.max_chunk_size, &SplitOptions::default());
        let total = chunks.len();
        let request_id = Uuid::new_v4().to_string();
        if total == 0 {
            debug!("empty payload, nothing to send");
            return Ok(SendReceipt {
                request_id,
                total_chunks: 0,
                chars: 0,
            });
        }

        let config = ScheduleConfig {
            chunk_delay: self.chunk_delay,
            continue_on_error: false,
            ..Default::default()
        };
        let scheduler: Scheduler<()> = Scheduler::new(config, self.retry.clone())
            .with_cancel(self.cancel.clone())
            .with_progress(self.progress.clone());

        let transport = self.transport.clone();
        let id = request_id.clone();
        scheduler
            .run(
                chunks,
                processor(move |payload: String, index| {
                    let transport = transport.clone();
                    let headers = ChunkHeaders::new(&id, index, total);
                    async move { transport.send_chunk(headers, payload).await }
                }),
            )
            .await?;

        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        self.retry
            .run(
                || self.transport.complete(&request_id, total),
                "chunked send complete",
            )
            .await
            .map_err(|err| BatchError::protocol("complete", err.attempts, err.error))?;

        info!(
            "chunked send {} delivered in {} chunk(s)",
            request_id, total
        );
        Ok(SendReceipt {
            request_id,
            total_chunks: total,
            chars: payload.chars().count(),
        })
    }
}

// ============================================================================
// File uploads
// ============================================================================

/// Everything the receiver needs before the first data chunk arrives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadManifest {
    pub upload_id: String,
    pub file_name: String,
    pub size_bytes: usize,
    /// Guessed from the file name; `application/octet-stream` when unknown
    pub content_type: String,
    pub total_chunks: usize,
    /// Caller-supplied metadata passed through untouched
    pub metadata: Value,
}

/// Caller-injected transport for three-phase file uploads.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// Announce the upload: file name, size, content type, chunk count.
    async fn init(&self, manifest: &UploadManifest) -> anyhow::Result<()>;

    /// Deliver one data chunk of the upload.
    async fn upload_chunk(
        &self,
        upload_id: &str,
        index: usize,
        total: usize,
        data: Vec<u8>,
    ) -> anyhow::Result<()>;

    /// Finalize the upload referenced by `upload_id`.
    async fn complete(&self, upload_id: &str, total_chunks: usize) -> anyhow::Result<()>;
}

/// What a finished upload looked like
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub upload_id: String,
    pub total_chunks: usize,
    pub bytes: usize,
}

/// Splits a file and drives it through an [`UploadTransport`].
pub struct FileUploader {
    transport: Arc<dyn UploadTransport>,
    max_chunk_size: usize,
    retry: RetryPolicy,
    chunk_delay: Duration,
    progress: SharedProgress,
    cancel: CancelSignal,
}

impl FileUploader {
    pub fn new(transport: Arc<dyn UploadTransport>) -> Self {
        Self {
            transport,
            max_chunk_size: 5000,
            retry: RetryPolicy::default(),
            chunk_delay: Duration::ZERO,
            progress: Arc::new(ProgressSender::new()),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn watch_progress(&self) -> ProgressWatch {
        self.progress.subscribe()
    }

    /// Stop dispatching further chunks; see [`ChunkedSender::cancel`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run the three-phase upload protocol: `init`, one `upload_chunk` per
    /// data chunk in index order, then `complete` with the same upload id.
    ///
    /// Text files are chunked on line boundaries so no chunk ends mid-line;
    /// everything else uses raw byte ranges. An empty file is already
    /// complete and touches the transport not at all.
    pub async fn upload(
        &self,
        file_name: &str,
        data: &[u8],
        metadata: Value,
    ) -> BatchResult<UploadReceipt> {
        let content_type = mime_guess::from_path(file_name)
            .first_or_octet_stream()
            .to_string();
        let align_newlines = content_type.starts_with("text/");
        let chunks = split_bytes(data, self.max_chunk_size, align_newlines);
        let total = chunks.len();
        let upload_id = Uuid::new_v4().to_string();
        if total == 0 {
            debug!("empty file {}, nothing to upload", file_name);
            return Ok(UploadReceipt {
                upload_id,
                total_chunks: 0,
                bytes: 0,
            });
        }

        let manifest = UploadManifest {
            upload_id: upload_id.clone(),
            file_name: file_name.to_string(),
            size_bytes: data.len(),
            content_type,
            total_chunks: total,
            metadata,
        };
        self.retry
            .run(|| self.transport.init(&manifest), "upload init")
            .await
            .map_err(|err| BatchError::protocol("init", err.attempts, err.error))?;

        let config = ScheduleConfig {
            chunk_delay: self.chunk_delay,
            continue_on_error: false,
            ..Default::default()
        };
        let scheduler: Scheduler<()> = Scheduler::new(config, self.retry.clone())
            .with_cancel(self.cancel.clone())
            .with_progress(self.progress.clone());

        let transport = self.transport.clone();
        let id = upload_id.clone();
        scheduler
            .run(
                chunks,
                processor(move |data: Vec<u8>, index| {
                    let transport = transport.clone();
                    let id = id.clone();
                    async move { transport.upload_chunk(&id, index, total, data).await }
                }),
            )
            .await?;

        if self.cancel.is_cancelled() {
            return Err(BatchError::Cancelled);
        }
        self.retry
            .run(
                || self.transport.complete(&upload_id, total),
                "upload complete",
            )
            .await
            .map_err(|err| BatchError::protocol("complete", err.attempts, err.error))?;

        info!(
            "upload {} of {} finished in {} chunk(s)",
            upload_id, file_name, total
        );
        Ok(UploadReceipt {
            upload_id,
            total_chunks: total,
            bytes: data.len(),
        })
    }
}
