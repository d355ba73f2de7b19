//! Concurrent ranged-download engine
//!
//! Fetches HTTP(S) resources with parallel range-based chunking for large
//! files, resumable transfers backed by a sidecar manifest, shared
//! bandwidth limiting, and throttled progress reporting.
//!
//! The free functions below build a one-shot [`DownloadManager`] per call.
//! Hosts that want connection reuse across downloads construct a single
//! manager and call its methods directly:
//!
//! ```no_run
//! use engine::{DownloadManager, DownloadOptions, CancellationToken};
//!
//! # async fn demo() -> Result<(), engine::DownloadError> {
//! let manager = DownloadManager::new(DownloadOptions::default())?;
//! let cancel = CancellationToken::new();
//! let outcome = manager
//!     .download_to_path(&cancel, "https://example.com/big.iso", "big.iso".as_ref())
//!     .await?;
//! println!("fetched {} bytes", outcome.bytes_downloaded);
//! # Ok(())
//! # }
//! ```

mod error;
mod http;
mod limiter;
mod manager;
mod options;
mod planner;
mod progress;
mod resume;
mod worker;

pub use error::{DownloadError, ErrorKind};
pub use http::OriginDescriptor;
pub use limiter::RateLimiter;
pub use manager::{DownloadManager, DownloadOutcome};
pub use options::DownloadOptions;
pub use planner::{chunk_count_for, plan_chunks, ChunkSpec, MAX_CHUNKS};
pub use progress::{ProgressCallback, ProgressSnapshot};
pub use resume::{hash_file, ResumeManifest, ResumeStore, UNKNOWN_TOTAL};

// the cancellation "context" callers pass into every entry point
pub use tokio_util::sync::CancellationToken;

use std::path::Path;
use tokio::io::AsyncWrite;

/// Downloads `url` into the file at `dest`.
pub async fn download_to_path(
    cancel: &CancellationToken,
    url: &str,
    dest: &Path,
    options: DownloadOptions,
) -> Result<DownloadOutcome, DownloadError> {
    DownloadManager::new(options)?
        .download_to_path(cancel, url, dest)
        .await
}

/// Streams `url` into a caller-provided sink (always single-stream).
pub async fn download_to_writer<W>(
    cancel: &CancellationToken,
    url: &str,
    sink: &mut W,
    options: DownloadOptions,
) -> Result<DownloadOutcome, DownloadError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    DownloadManager::new(options)?
        .download_to_writer(cancel, url, sink)
        .await
}

/// Downloads `url` into memory, bounded by
/// [`DownloadOptions::max_memory_size`].
pub async fn download_to_memory(
    cancel: &CancellationToken,
    url: &str,
    options: DownloadOptions,
) -> Result<(Vec<u8>, DownloadOutcome), DownloadError> {
    DownloadManager::new(options)?
        .download_to_memory(cancel, url)
        .await
}

/// Probes `url` without downloading: final URL, declared size, range
/// support, and validators.
pub async fn probe(
    cancel: &CancellationToken,
    url: &str,
    options: DownloadOptions,
) -> Result<OriginDescriptor, DownloadError> {
    DownloadManager::new(options)?.probe(cancel, url).await
}
