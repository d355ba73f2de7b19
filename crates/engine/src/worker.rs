//! Per-chunk download worker

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::Client;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{DownloadError, ErrorKind};
use crate::http::{apply_headers, send_cancellable};
use crate::limiter::RateLimiter;
use crate::planner::ChunkSpec;
use crate::progress::ProgressHandle;

/// Retries per chunk on transient failures (4 attempts total).
pub(crate) const MAX_RETRIES: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Delay before retry number `attempt` (1-based): 100 ms doubling, capped
/// at one second.
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    BACKOFF_CAP.min(BACKOFF_BASE * factor)
}

pub(crate) struct WorkerOutcome {
    pub chunk: ChunkSpec,
    /// Failed attempts before success
    pub retries: u32,
}

/// Fetches exactly one chunk's byte range into its own file.
///
/// The worker owns its [`ChunkSpec`] and write handle for its whole
/// lifetime; the manager only reads the spec back after join.
pub(crate) struct ChunkWorker {
    pub client: Client,
    pub url: String,
    pub headers: Arc<Vec<(String, String)>>,
    pub chunk: ChunkSpec,
    pub path: PathBuf,
    pub limiter: Arc<RateLimiter>,
    pub progress: ProgressHandle,
    pub cancel: CancellationToken,
}

impl ChunkWorker {
    pub async fn run(mut self) -> Result<WorkerOutcome, DownloadError> {
        let mut retries = 0u32;
        loop {
            match self.attempt().await {
                Ok(()) => {
                    if self.chunk.downloaded != self.chunk.size() {
                        return Err(DownloadError::corrupted(format!(
                            "chunk {} size mismatch: got {} bytes, expected {}",
                            self.chunk.index,
                            self.chunk.downloaded,
                            self.chunk.size()
                        ))
                        .with_url(&self.url));
                    }
                    self.chunk.complete = true;
                    self.progress
                        .complete(self.chunk.index, self.chunk.downloaded)
                        .await;
                    return Ok(WorkerOutcome {
                        chunk: self.chunk,
                        retries,
                    });
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    retries += 1;
                    if !e.is_transient() || retries > MAX_RETRIES {
                        return Err(e);
                    }
                    let delay = backoff_delay(retries);
                    warn!(
                        chunk = self.chunk.index,
                        attempt = retries,
                        error = %e,
                        "chunk attempt failed, retrying in {delay:?}"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(DownloadError::cancelled()),
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One transfer attempt, resuming from the chunk's current high-water
    /// mark.
    async fn attempt(&mut self) -> Result<(), DownloadError> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::cancelled());
        }
        if self.chunk.remaining() == 0 {
            return Ok(());
        }

        let range = format!("bytes={}-{}", self.chunk.resume_position(), self.chunk.end);
        debug!(chunk = self.chunk.index, %range, "requesting chunk");

        let request = apply_headers(self.client.get(&self.url), &self.headers).header(RANGE, range);
        let response = send_cancellable(request, &self.cancel, &self.url).await?;

        match response.status().as_u16() {
            206 => {}
            200 if self.chunk.downloaded == 0 => {
                // origin ignored the Range header; the body is the whole
                // chunk starting at byte zero
            }
            200 => {
                return Err(DownloadError::corrupted(format!(
                    "origin ignored Range while resuming chunk {} at byte {}",
                    self.chunk.index, self.chunk.downloaded
                ))
                .with_url(&self.url)
                .with_status(200));
            }
            status => {
                return Err(DownloadError::from_status(
                    status,
                    &self.url,
                    self.chunk.downloaded > 0,
                ));
            }
        }

        let mut file = self.open_chunk_file().await?;
        let mut stream = response.bytes_stream();

        let chunk = &mut self.chunk;
        let streamed: Result<(), DownloadError> = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(DownloadError::cancelled()),
                    next = stream.next() => next,
                };
                let Some(item) = next else { break };
                let bytes = item.map_err(|e| DownloadError::from_reqwest(e, &self.url))?;
                if bytes.is_empty() {
                    continue;
                }

                let n = bytes.len() as u64;
                if chunk.downloaded + n > chunk.size() {
                    return Err(DownloadError::corrupted(format!(
                        "origin sent more than the {} bytes of chunk {}",
                        chunk.size(),
                        chunk.index
                    ))
                    .with_url(&self.url));
                }

                self.limiter.wait(&self.cancel, n).await?;
                file.write_all(&bytes)
                    .await
                    .map_err(|e| DownloadError::from_io(e, &self.path))?;
                chunk.downloaded += n;
                self.progress.update(chunk.index, chunk.downloaded);
            }
            Ok(())
        }
        .await;

        // settle buffered writes on every exit so the on-disk size is
        // stable before anyone reads it for resume bookkeeping
        let flushed = file
            .flush()
            .await
            .map_err(|e| DownloadError::from_io(e, &self.path));
        streamed.and(flushed)
    }

    /// Append when resuming a partially written chunk, truncate otherwise.
    async fn open_chunk_file(&self) -> Result<File, DownloadError> {
        let result = if self.chunk.downloaded > 0 {
            OpenOptions::new().append(true).open(&self.path).await
        } else {
            File::create(&self.path).await
        };
        result.map_err(|e| DownloadError::from_io(e, &self.path))
    }
}
