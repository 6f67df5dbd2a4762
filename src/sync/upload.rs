//! Blob uploader.
//!
//! Payloads are streamed to blob storage in chunks of `upload_chunk_size` bytes. Transient chunk
//! failures are retried with backoff; a terminal failure reports how many bytes the store had
//! committed so the caller can choose between resuming and restarting.

use std::cmp;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use url::Url;

use crate::platform::runtime::{sleep, with_deadline};
use crate::sync::adapter::RuntimeAdapter;
use crate::sync::error::{invalid_argument, unknown, SyncError, SyncErrorKind, SyncResult};
use crate::sync::settings::SyncSettings;
use crate::util::{calculate_backoff, BackoffConfig};

/// Progress reported after every committed chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

impl UploadProgress {
    pub fn new(bytes_sent: u64, total_bytes: u64) -> Self {
        Self {
            bytes_sent,
            total_bytes,
        }
    }

    /// Share of the payload committed so far, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            1.0
        } else {
            self.bytes_sent as f64 / self.total_bytes as f64
        }
    }
}

/// Streams byte buffers to blob storage in bounded chunks.
///
/// Transient chunk failures are retried with backoff and never reported to the caller; a terminal
/// failure carries the number of bytes the store had committed when it happened.
pub struct BlobUploader {
    adapter: Arc<dyn RuntimeAdapter>,
    chunk_size: usize,
    chunk_retries: u32,
    backoff: BackoffConfig,
}

impl BlobUploader {
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, settings: &SyncSettings) -> Self {
        Self {
            adapter,
            chunk_size: settings.upload_chunk_size.max(1),
            chunk_retries: settings.upload_chunk_retries,
            backoff: settings.upload_backoff,
        }
    }

    /// Uploads `bytes` to `path` and resolves the durable download URL.
    pub async fn upload<P>(
        &self,
        path: &str,
        bytes: Bytes,
        on_progress: P,
        deadline: Option<Duration>,
    ) -> SyncResult<String>
    where
        P: FnMut(UploadProgress) + Send,
    {
        let path = validate_path(path)?;
        let committed = AtomicU64::new(0);
        with_deadline(deadline, self.transfer(&path, bytes, on_progress, &committed))
            .await
            .map_err(|err| match err.bytes_committed() {
                Some(_) => err,
                None => err.with_bytes_committed(committed.load(Ordering::SeqCst)),
            })
    }

    async fn transfer<P>(&self, path: &str, bytes: Bytes, mut on_progress: P, committed: &AtomicU64) -> SyncResult<String>
    where
        P: FnMut(UploadProgress) + Send,
    {
        let total = bytes.len() as u64;
        let checksum = STANDARD.encode(Sha256::digest(&bytes));
        let session = self
            .adapter
            .begin_upload(path, total)
            .await
            .map_err(|err| terminal(err, 0))?;

        let mut sent = 0u64;
        let mut failures = 0u32;
        while sent < total {
            let end = cmp::min(total, sent + self.chunk_size as u64);
            let chunk = bytes.slice(sent as usize..end as usize);
            let failure = match self.adapter.upload_chunk(&session, sent, chunk).await {
                Ok(acknowledged) if acknowledged > sent => {
                    sent = acknowledged.min(total);
                    failures = 0;
                    committed.store(sent, Ordering::SeqCst);
                    on_progress(UploadProgress::new(sent, total));
                    continue;
                }
                Ok(acknowledged) => SyncError::new(
                    SyncErrorKind::Unavailable,
                    format!("store acknowledged {acknowledged} bytes without progress past {sent}"),
                ),
                Err(err) => err,
            };
            if !failure.retryable() || failures >= self.chunk_retries {
                log::warn!("upload of {path} failed at byte {sent} of {total}: {failure}");
                return Err(terminal(failure, sent));
            }
            let delay = calculate_backoff(failures, &self.backoff);
            failures += 1;
            log::debug!(
                "retrying chunk at byte {sent} of {path} (retry {failures} of {}) after {} ms",
                self.chunk_retries,
                delay.as_millis()
            );
            sleep(delay).await;
        }
        if total == 0 {
            on_progress(UploadProgress::new(0, 0));
        }

        let url = self
            .adapter
            .finish_upload(&session, &checksum)
            .await
            .map_err(|err| terminal(err, sent))?;
        Url::parse(&url)
            .map_err(|err| terminal(unknown(format!("store returned an invalid download URL {url}: {err}")), sent))?;
        log::debug!("uploaded {total} bytes to {path}");
        Ok(url)
    }
}

fn validate_path(path: &str) -> SyncResult<String> {
    let trimmed = path.trim().trim_matches('/');
    if trimmed.is_empty() {
        return Err(invalid_argument("Upload path must not be empty"));
    }
    if trimmed.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(invalid_argument(format!("Invalid upload path {path}")));
    }
    Ok(trimmed.to_string())
}

/// Terminal upload errors are either passed through (caller mistakes, quota, cancellation) or
/// reported as `Unavailable`, always with the committed byte count.
fn terminal(err: SyncError, bytes_committed: u64) -> SyncError {
    let kind = match err.kind {
        SyncErrorKind::Cancelled
        | SyncErrorKind::PermissionDenied
        | SyncErrorKind::InvalidArgument
        | SyncErrorKind::ResourceExhausted
        | SyncErrorKind::NotFound => err.kind,
        _ => SyncErrorKind::Unavailable,
    };
    SyncError::new(kind, err.message()).with_bytes_committed(bytes_committed)
}
