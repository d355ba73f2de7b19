//! Download orchestration
//!
//! The manager drives one download end to end: probe the origin, decide
//! between single-stream and chunked transfer, run the worker pool, merge
//! chunk files into the destination, and commit or preserve partial state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, Response};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DownloadError, ErrorKind};
use crate::http::{
    apply_headers, build_client, content_length_of, probe_origin, send_cancellable, validate_url,
    OriginDescriptor,
};
use crate::limiter::RateLimiter;
use crate::options::DownloadOptions;
use crate::planner::{plan_chunks, ChunkSpec};
use crate::progress::{ProgressAggregator, ProgressHandle};
use crate::resume::{
    chunk_bytes_on_disk, hash_file, now_unix, ResumeManifest, ResumeStore, HASH_CEILING,
    UNKNOWN_TOTAL,
};
use crate::worker::{ChunkWorker, MAX_RETRIES};

/// Spacing between manifest checkpoints while a transfer runs.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a completed download call
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    /// Bytes fetched during this call (a resumed call excludes the bytes
    /// already on disk when it started)
    pub bytes_downloaded: u64,
    pub duration: Duration,
    /// Worker retry total across all chunks
    pub retries: u32,
    /// URL after following redirects
    pub final_url: String,
    /// Declared `Content-Type`, when the origin sent one
    pub content_type: Option<String>,
}

/// Orchestrates downloads over one shared connection pool.
///
/// Construct one manager and reuse it when process-wide connection reuse is
/// wanted; every entry point is `&self` and safe to call concurrently.
pub struct DownloadManager {
    client: Client,
    options: DownloadOptions,
}

impl DownloadManager {
    /// Validates the options and builds the HTTP client.
    pub fn new(options: DownloadOptions) -> Result<Self, DownloadError> {
        let options = options.validated()?;
        let client = build_client(&options)?;
        Ok(Self { client, options })
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    /// Probes the URL without downloading.
    pub async fn probe(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<OriginDescriptor, DownloadError> {
        validate_url(url)?;
        probe_origin(&self.client, url, &self.options.headers, cancel).await
    }

    /// Downloads the URL into `dest`, choosing between single-stream and
    /// chunked transfer based on what the origin supports.
    pub async fn download_to_path(
        &self,
        cancel: &CancellationToken,
        url: &str,
        dest: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        validate_url(url)?;
        let started = Instant::now();
        let deadline = self.options.timeout.map(|t| started + t);
        let mut attempts = 0u32;

        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(deadline_error());
                    }
                    Some(left)
                }
                None => None,
            };
            let guard = CallGuard::new(cancel, remaining);
            let result = self
                .run_to_path(&guard, url, dest, started)
                .await
                .map_err(|e| guard.reclassify(e));

            match result {
                Err(e)
                    if e.is_transient()
                        && !guard.timed_out()
                        && !cancel.is_cancelled()
                        && attempts < self.options.retry_attempts =>
                {
                    attempts += 1;
                    warn!(attempt = attempts, error = %e, "retrying download call");
                }
                other => return other,
            }
        }
    }

    /// Streams the URL into a caller-provided sink. Always single-stream;
    /// resume and whole-call retry do not apply because bytes already
    /// handed to the sink cannot be taken back. The rate limit does apply.
    pub async fn download_to_writer<W>(
        &self,
        cancel: &CancellationToken,
        url: &str,
        sink: &mut W,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        validate_url(url)?;
        let started = Instant::now();
        let guard = CallGuard::new(cancel, self.options.timeout);

        let result = self.run_to_sink(&guard, url, sink, started, None).await;
        result.map_err(|e| guard.reclassify(e))
    }

    /// Downloads the URL into memory, failing with a validation error once
    /// the body exceeds `max_memory_size`.
    pub async fn download_to_memory(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<(Vec<u8>, DownloadOutcome), DownloadError> {
        validate_url(url)?;
        let started = Instant::now();
        let guard = CallGuard::new(cancel, self.options.timeout);

        let mut buffer = Vec::new();
        let result = self
            .run_to_sink(
                &guard,
                url,
                &mut buffer,
                started,
                Some(self.options.max_memory_size),
            )
            .await;
        match result {
            Ok(outcome) => Ok((buffer, outcome)),
            Err(e) => Err(guard.reclassify(e)),
        }
    }

    async fn run_to_path(
        &self,
        guard: &CallGuard,
        url: &str,
        dest: &Path,
        started: Instant,
    ) -> Result<DownloadOutcome, DownloadError> {
        self.prepare_destination(dest).await?;

        let origin = probe_origin(&self.client, url, &self.options.headers, &guard.cancel).await?;
        debug!(?origin, "origin probed");

        let store = ResumeStore::for_destination(dest);
        let chunk_dir = chunk_dir_for(dest);

        // strategy: chunked needs range support, a known size, and a plan
        // of more than one chunk
        let plan = match origin.total_bytes {
            Some(total) if origin.supports_ranges && total > 0 => {
                let plan = plan_chunks(Some(total), self.options.chunk_count);
                (plan.len() > 1).then_some(plan)
            }
            _ => None,
        };

        // resume decision
        let mut resumed: Option<ResumeManifest> = None;
        if self.options.resume {
            if let Some(manifest) = store.load().await {
                let expected_layout = plan.as_ref().map(|p| p.len() as u32).unwrap_or(1);
                let dir_probe = plan.as_ref().map(|_| chunk_dir.as_path());
                if manifest.chunk_count == expected_layout
                    && validators_match(&manifest, &origin)
                    && store.can_resume(&manifest, dir_probe).await
                {
                    info!(
                        downloaded = manifest.downloaded_bytes,
                        "resuming from recorded partial state"
                    );
                    resumed = Some(manifest);
                } else {
                    info!("stale or invalid resume state, restarting from byte 0");
                    discard_partial_state(&store, dest, &chunk_dir).await;
                }
            }
        }

        let was_resuming = resumed.is_some();
        let result = match plan.clone() {
            Some(plan) => {
                self.run_chunked(guard, dest, &origin, plan, &store, &chunk_dir, resumed, started)
                    .await
            }
            None => {
                self.run_single(guard, dest, &origin, &store, resumed, started)
                    .await
            }
        };

        // corrupted resume state is discarded and the call restarted once
        // from a clean slate
        match result {
            Err(e) if e.kind() == ErrorKind::CorruptedData && was_resuming => {
                warn!(error = %e, "resume state corrupt, discarding and restarting");
                discard_partial_state(&store, dest, &chunk_dir).await;
                match plan {
                    Some(plan) => {
                        self.run_chunked(
                            guard, dest, &origin, plan, &store, &chunk_dir, None, started,
                        )
                        .await
                    }
                    None => {
                        self.run_single(guard, dest, &origin, &store, None, started)
                            .await
                    }
                }
            }
            other => other,
        }
    }

    /// Multi-chunk transfer: one worker per chunk, bounded by the
    /// concurrency option, merged into the destination on success.
    #[allow(clippy::too_many_arguments)]
    async fn run_chunked(
        &self,
        guard: &CallGuard,
        dest: &Path,
        origin: &OriginDescriptor,
        mut plan: Vec<ChunkSpec>,
        store: &ResumeStore,
        chunk_dir: &Path,
        resumed: Option<ResumeManifest>,
        started: Instant,
    ) -> Result<DownloadOutcome, DownloadError> {
        let total = origin
            .total_bytes
            .ok_or_else(|| DownloadError::config("chunked transfer without a known size"))?;

        tokio::fs::create_dir_all(chunk_dir)
            .await
            .map_err(|e| DownloadError::from_io(e, chunk_dir))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            let _ = tokio::fs::set_permissions(chunk_dir, perms).await;
        }

        if resumed.is_some() {
            apply_chunk_resume(&mut plan, chunk_dir).await;
        }
        let seeded: u64 = plan.iter().map(|c| c.downloaded).sum();

        let aggregator = ProgressAggregator::spawn(
            Some(total),
            plan.len() as u32,
            self.options.progress_callback.clone(),
        );
        let handle = aggregator.handle();
        for spec in &plan {
            if spec.complete {
                handle.complete(spec.index, spec.downloaded).await;
            } else if spec.downloaded > 0 {
                handle.update(spec.index, spec.downloaded);
            }
        }

        let limiter = Arc::new(RateLimiter::new(self.options.max_rate));
        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency as usize));
        let headers = Arc::new(self.options.headers.clone());
        let template = self.manifest_template(origin, dest, plan.len() as u32, resumed.as_ref());

        // fail-stop token for this run only: the first terminal error
        // cancels the remaining workers without poisoning the call token,
        // which a corrupted-resume restart still needs
        let run_cancel = guard.cancel.child_token();

        let mut join = JoinSet::new();
        for spec in plan.iter().copied().filter(|c| !c.complete) {
            let worker = ChunkWorker {
                client: self.client.clone(),
                url: origin.final_url.clone(),
                headers: Arc::clone(&headers),
                chunk: spec,
                path: chunk_file_path(chunk_dir, spec.index),
                limiter: Arc::clone(&limiter),
                progress: handle.clone(),
                cancel: run_cancel.clone(),
            };
            let semaphore = Arc::clone(&semaphore);
            let cancel = run_cancel.clone();
            join.spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(DownloadError::cancelled()),
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Err(DownloadError::cancelled()),
                    },
                };
                worker.run().await
            });
        }

        let checkpoint = self.spawn_checkpoints(store, &handle, &template);

        // first terminal error wins; the rest unwind via the shared token
        // and are logged only
        let mut first_err: Option<DownloadError> = None;
        let mut retries = 0u32;
        while let Some(result) = join.join_next().await {
            match result {
                Ok(Ok(outcome)) => {
                    debug!(chunk = outcome.chunk.index, "chunk complete");
                    retries += outcome.retries;
                }
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        run_cancel.cancel();
                        first_err = Some(e);
                    } else if e.kind() != ErrorKind::Cancelled {
                        warn!(error = %e, "worker failed after the first terminal error");
                    }
                }
                Err(join_err) => {
                    let e = DownloadError::new(
                        ErrorKind::Unknown,
                        format!("worker task failed: {join_err}"),
                    );
                    if first_err.is_none() {
                        run_cancel.cancel();
                        first_err = Some(e);
                    } else {
                        warn!(error = %e, "worker task failed after the first terminal error");
                    }
                }
            }
        }

        if let Some(task) = checkpoint {
            task.abort();
            let _ = task.await;
        }
        drop(handle);

        if let Some(err) = first_err {
            // keep the chunk directory and manifest so a later call can
            // pick up from the high-water marks
            if self.options.resume {
                let on_disk = chunk_bytes_on_disk(chunk_dir).await.unwrap_or(0);
                if on_disk > 0 {
                    let manifest = template.build(on_disk, String::new());
                    if let Err(e) = store.save(&manifest).await {
                        warn!(error = %e, "failed to save resume manifest");
                    }
                }
            }
            aggregator.emit_now();
            return Err(err);
        }

        if let Err(e) = merge_chunks(dest, chunk_dir, plan.len() as u32).await {
            // a half-merged destination is useless; the chunk files are not
            let _ = tokio::fs::remove_file(dest).await;
            if self.options.resume {
                let on_disk = chunk_bytes_on_disk(chunk_dir).await.unwrap_or(0);
                let manifest = template.build(on_disk, String::new());
                if let Err(e) = store.save(&manifest).await {
                    warn!(error = %e, "failed to save resume manifest");
                }
            }
            aggregator.emit_now();
            return Err(e);
        }

        if let Err(e) = tokio::fs::remove_dir_all(chunk_dir).await {
            warn!(error = %e, "failed to remove chunk directory");
        }
        if let Err(e) = store.delete().await {
            warn!(error = %e, "failed to remove resume manifest");
        }

        let snapshot = aggregator.finish().await;
        info!(
            bytes = snapshot.downloaded_bytes,
            chunks = plan.len(),
            "chunked download committed"
        );
        Ok(DownloadOutcome {
            bytes_downloaded: snapshot.downloaded_bytes.saturating_sub(seeded),
            duration: started.elapsed(),
            retries,
            final_url: origin.final_url.clone(),
            content_type: origin.content_type.clone(),
        })
    }

    /// Single-stream transfer straight into the destination file.
    async fn run_single(
        &self,
        guard: &CallGuard,
        dest: &Path,
        origin: &OriginDescriptor,
        store: &ResumeStore,
        resumed: Option<ResumeManifest>,
        started: Instant,
    ) -> Result<DownloadOutcome, DownloadError> {
        let resume_offset = resumed.as_ref().map(|m| m.downloaded_bytes).unwrap_or(0);
        let url = &origin.final_url;

        let (response, retries) = self
            .request_with_retry(guard, url, (resume_offset > 0).then_some(resume_offset))
            .await?;

        let mut offset = resume_offset;
        if response.status().as_u16() != 206 && resume_offset > 0 {
            // origin ignored the Range header; its full body is
            // authoritative, so start over
            warn!("origin ignored Range, restarting single-stream download from byte 0");
            offset = 0;
        }
        let seeded = offset;

        let total = match origin.total_bytes {
            Some(total) => Some(total),
            None => content_length_of(&response).map(|len| offset + len),
        };

        let file = if offset > 0 {
            OpenOptions::new().append(true).open(dest).await
        } else {
            File::create(dest).await
        };
        let mut file = file.map_err(|e| DownloadError::from_io(e, dest))?;

        let aggregator =
            ProgressAggregator::spawn(total, 1, self.options.progress_callback.clone());
        let handle = aggregator.handle();
        if offset > 0 {
            handle.update(0, offset);
        }

        let limiter = RateLimiter::new(self.options.max_rate);
        let template = self.manifest_template(origin, dest, 1, resumed.as_ref());
        let checkpoint = self.spawn_checkpoints(store, &handle, &template);

        let mut stream = response.bytes_stream();
        let streamed: Result<(), DownloadError> = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = guard.cancel.cancelled() => return Err(DownloadError::cancelled()),
                    next = stream.next() => next,
                };
                let Some(item) = next else { break };
                let bytes = item.map_err(|e| DownloadError::from_reqwest(e, url))?;
                if bytes.is_empty() {
                    continue;
                }
                let n = bytes.len() as u64;
                limiter.wait(&guard.cancel, n).await?;
                file.write_all(&bytes)
                    .await
                    .map_err(|e| DownloadError::from_io(e, dest))?;
                offset += n;
                handle.update(0, offset);
            }
            Ok(())
        }
        .await;

        // settle buffered writes before the partial size is recorded
        let flushed = file
            .flush()
            .await
            .map_err(|e| DownloadError::from_io(e, dest));
        let stream_result = streamed.and(flushed);

        if let Some(task) = checkpoint {
            task.abort();
            let _ = task.await;
        }

        let stream_result = stream_result.and_then(|()| match total {
            Some(total) if offset != total => Err(DownloadError::corrupted(format!(
                "size mismatch: got {offset} bytes, expected {total}"
            ))
            .with_url(url)),
            _ => Ok(()),
        });

        if let Err(e) = stream_result {
            if self.options.resume && offset > 0 {
                self.preserve_single_stream(store, &template, dest).await;
            }
            aggregator.emit_now();
            return Err(e);
        }

        handle.complete(0, offset).await;
        drop(handle);
        if let Err(e) = store.delete().await {
            warn!(error = %e, "failed to remove resume manifest");
        }

        let snapshot = aggregator.finish().await;
        info!(bytes = snapshot.downloaded_bytes, "single-stream download committed");
        Ok(DownloadOutcome {
            bytes_downloaded: offset.saturating_sub(seeded),
            duration: started.elapsed(),
            retries,
            final_url: origin.final_url.clone(),
            content_type: origin.content_type.clone(),
        })
    }

    /// Shared body for the writer and memory entry points: plain GET,
    /// optional size cap, no resume.
    async fn run_to_sink<W>(
        &self,
        guard: &CallGuard,
        url: &str,
        sink: &mut W,
        started: Instant,
        cap: Option<u64>,
    ) -> Result<DownloadOutcome, DownloadError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let (response, retries) = self.request_with_retry(guard, url, None).await?;
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total = content_length_of(&response);

        if let (Some(cap), Some(total)) = (cap, total) {
            if total > cap {
                return Err(DownloadError::validation(format!(
                    "declared size {total} exceeds the in-memory limit of {cap} bytes"
                ))
                .with_url(url));
            }
        }

        let aggregator =
            ProgressAggregator::spawn(total, 1, self.options.progress_callback.clone());
        let handle = aggregator.handle();
        let limiter = RateLimiter::new(self.options.max_rate);

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        let stream_result: Result<(), DownloadError> = async {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = guard.cancel.cancelled() => return Err(DownloadError::cancelled()),
                    next = stream.next() => next,
                };
                let Some(item) = next else { break };
                let bytes = item.map_err(|e| DownloadError::from_reqwest(e, url))?;
                if bytes.is_empty() {
                    continue;
                }
                let n = bytes.len() as u64;
                if let Some(cap) = cap {
                    if downloaded + n > cap {
                        return Err(DownloadError::validation(format!(
                            "body exceeds the in-memory limit of {cap} bytes"
                        ))
                        .with_url(url));
                    }
                }
                limiter.wait(&guard.cancel, n).await?;
                sink.write_all(&bytes)
                    .await
                    .map_err(|e| DownloadError::new(ErrorKind::Unknown, e.to_string()))?;
                downloaded += n;
                handle.update(0, downloaded);
            }
            sink.flush()
                .await
                .map_err(|e| DownloadError::new(ErrorKind::Unknown, e.to_string()))?;
            Ok(())
        }
        .await;

        if let Err(e) = stream_result {
            aggregator.emit_now();
            return Err(e);
        }

        handle.complete(0, downloaded).await;
        drop(handle);
        let snapshot = aggregator.finish().await;

        Ok(DownloadOutcome {
            bytes_downloaded: snapshot.downloaded_bytes,
            duration: started.elapsed(),
            retries,
            final_url,
            content_type,
        })
    }

    /// Issues the initial GET with the worker backoff schedule applied to
    /// transient failures. No body bytes have flowed yet, so retrying here
    /// is always safe.
    async fn request_with_retry(
        &self,
        guard: &CallGuard,
        url: &str,
        range_offset: Option<u64>,
    ) -> Result<(Response, u32), DownloadError> {
        let mut retries = 0u32;
        loop {
            let mut request = apply_headers(self.client.get(url), &self.options.headers);
            if let Some(offset) = range_offset {
                request = request.header(RANGE, format!("bytes={offset}-"));
            }

            let attempt = match send_cancellable(request, &guard.cancel, url).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        Ok(response)
                    } else {
                        Err(DownloadError::from_status(
                            status.as_u16(),
                            url,
                            range_offset.is_some(),
                        ))
                    }
                }
                Err(e) => Err(e),
            };

            match attempt {
                Ok(response) => return Ok((response, retries)),
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    retries += 1;
                    if !e.is_transient() || retries > MAX_RETRIES {
                        return Err(e);
                    }
                    let delay = crate::worker::backoff_delay(retries);
                    warn!(attempt = retries, error = %e, "request failed, retrying in {delay:?}");
                    tokio::select! {
                        _ = guard.cancel.cancelled() => return Err(DownloadError::cancelled()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Refuses or prepares the destination path per the options.
    async fn prepare_destination(&self, dest: &Path) -> Result<(), DownloadError> {
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            match tokio::fs::metadata(parent).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if self.options.create_dirs {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .map_err(|e| DownloadError::from_io(e, parent))?;
                    } else {
                        return Err(DownloadError::new(
                            ErrorKind::FileNotFound,
                            format!("destination directory {} does not exist", parent.display()),
                        ));
                    }
                }
                Err(e) => return Err(DownloadError::from_io(e, parent)),
            }
        }

        if !self.options.overwrite_existing && !self.options.resume {
            if tokio::fs::metadata(dest).await.is_ok() {
                return Err(DownloadError::validation(format!(
                    "destination {} already exists",
                    dest.display()
                )));
            }
        }
        Ok(())
    }

    fn manifest_template(
        &self,
        origin: &OriginDescriptor,
        dest: &Path,
        chunk_count: u32,
        prior: Option<&ResumeManifest>,
    ) -> ManifestTemplate {
        ManifestTemplate {
            url: origin.final_url.clone(),
            file_path: dest.to_string_lossy().into_owned(),
            total_bytes: origin
                .total_bytes
                .and_then(|t| i64::try_from(t).ok())
                .unwrap_or(UNKNOWN_TOTAL),
            etag: origin.etag.clone().unwrap_or_default(),
            last_modified: origin.last_modified.clone().unwrap_or_default(),
            content_length: origin.total_bytes.unwrap_or(0),
            created_at: prior.map(|m| m.created_at).unwrap_or_else(now_unix),
            user_agent: self.options.user_agent.clone(),
            accept_ranges: origin.supports_ranges,
            chunk_count,
        }
    }

    /// Periodic manifest checkpoints while a transfer runs; `None` when
    /// resume is disabled.
    fn spawn_checkpoints(
        &self,
        store: &ResumeStore,
        handle: &ProgressHandle,
        template: &ManifestTemplate,
    ) -> Option<JoinHandle<()>> {
        if !self.options.resume {
            return None;
        }
        let store = store.clone();
        let handle = handle.clone();
        let template = template.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(CHECKPOINT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let downloaded = handle.snapshot().downloaded_bytes;
                let manifest = template.build(downloaded, String::new());
                if let Err(e) = store.save(&manifest).await {
                    warn!(error = %e, "manifest checkpoint failed");
                }
            }
        }))
    }

    /// Preserves single-stream partial state, hashing the partial bytes
    /// unless the file is too large for that to be worthwhile.
    async fn preserve_single_stream(
        &self,
        store: &ResumeStore,
        template: &ManifestTemplate,
        dest: &Path,
    ) {
        let size = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => return,
        };
        if size == 0 {
            return;
        }
        let checksum = if size <= HASH_CEILING {
            hash_file(dest).await.unwrap_or_default()
        } else {
            String::new()
        };
        let manifest = template.build(size, checksum);
        if let Err(e) = store.save(&manifest).await {
            warn!(error = %e, "failed to save resume manifest");
        }
    }
}

/// Everything about a manifest that stays fixed for the duration of one
/// call; only the byte count, checksum, and update time move.
#[derive(Clone)]
struct ManifestTemplate {
    url: String,
    file_path: String,
    total_bytes: i64,
    etag: String,
    last_modified: String,
    content_length: u64,
    created_at: u64,
    user_agent: String,
    accept_ranges: bool,
    chunk_count: u32,
}

impl ManifestTemplate {
    fn build(&self, downloaded_bytes: u64, checksum: String) -> ResumeManifest {
        ResumeManifest {
            url: self.url.clone(),
            file_path: self.file_path.clone(),
            downloaded_bytes,
            total_bytes: self.total_bytes,
            etag: self.etag.clone(),
            last_modified: self.last_modified.clone(),
            content_length: self.content_length,
            checksum,
            created_at: self.created_at,
            updated_at: now_unix(),
            user_agent: self.user_agent.clone(),
            accept_ranges: self.accept_ranges,
            chunk_count: self.chunk_count,
        }
    }
}

/// Child token plus the deadline watchdog for one call attempt.
struct CallGuard {
    cancel: CancellationToken,
    timed_out: Arc<AtomicBool>,
    watchdog: Option<JoinHandle<()>>,
}

impl CallGuard {
    fn new(parent: &CancellationToken, timeout: Option<Duration>) -> Self {
        let cancel = parent.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = timeout.map(|timeout| {
            let cancel = cancel.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                timed_out.store(true, Ordering::SeqCst);
                cancel.cancel();
            })
        });
        Self {
            cancel,
            timed_out,
            watchdog,
        }
    }

    fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    /// A deadline expiry travels through the same cancellation path as a
    /// caller cancel; relabel it on the way out.
    fn reclassify(&self, err: DownloadError) -> DownloadError {
        if err.kind() == ErrorKind::Cancelled && self.timed_out() {
            deadline_error()
        } else {
            err
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.abort();
        }
    }
}

fn deadline_error() -> DownloadError {
    DownloadError::timeout("download exceeded the configured deadline")
}

/// `<dest>.chunks/`, sibling to the destination.
fn chunk_dir_for(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".chunks");
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

fn chunk_file_path(chunk_dir: &Path, index: u32) -> PathBuf {
    chunk_dir.join(format!("chunk_{index}"))
}

/// Compares stored validators (and size) against a fresh probe.
fn validators_match(manifest: &ResumeManifest, origin: &OriginDescriptor) -> bool {
    if manifest.total_bytes >= 0 {
        if let Some(total) = origin.total_bytes {
            if manifest.total_bytes as u64 != total {
                return false;
            }
        }
    }
    if !manifest.etag.is_empty() {
        return origin.etag.as_deref() == Some(manifest.etag.as_str());
    }
    if !manifest.last_modified.is_empty() {
        return origin.last_modified.as_deref() == Some(manifest.last_modified.as_str());
    }
    true
}

/// Loads per-chunk high-water marks from whatever chunk files survive.
async fn apply_chunk_resume(plan: &mut [ChunkSpec], chunk_dir: &Path) {
    for spec in plan.iter_mut() {
        let path = chunk_file_path(chunk_dir, spec.index);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() > spec.size() {
                // written under a different layout; rebuild this chunk
                spec.downloaded = 0;
            } else {
                spec.downloaded = meta.len();
                spec.complete = spec.downloaded == spec.size();
            }
        }
    }
}

async fn discard_partial_state(store: &ResumeStore, dest: &Path, chunk_dir: &Path) {
    if let Err(e) = store.delete().await {
        warn!(error = %e, "failed to remove resume manifest");
    }
    let _ = tokio::fs::remove_dir_all(chunk_dir).await;
    let _ = tokio::fs::remove_file(dest).await;
}

/// Appends chunk files to the destination in ascending index order; this
/// is the only step that turns per-chunk files into on-disk byte order.
async fn merge_chunks(dest: &Path, chunk_dir: &Path, count: u32) -> Result<(), DownloadError> {
    let mut out = File::create(dest)
        .await
        .map_err(|e| DownloadError::from_io(e, dest))?;
    for index in 0..count {
        let path = chunk_file_path(chunk_dir, index);
        let mut chunk = File::open(&path)
            .await
            .map_err(|e| DownloadError::from_io(e, &path))?;
        tokio::io::copy(&mut chunk, &mut out)
            .await
            .map_err(|e| DownloadError::from_io(e, dest))?;
    }
    out.flush()
        .await
        .map_err(|e| DownloadError::from_io(e, dest))?;
    out.sync_all()
        .await
        .map_err(|e| DownloadError::from_io(e, dest))?;
    Ok(())
}
