//! Library configuration surface

use std::fmt;
use std::time::Duration;

use crate::error::DownloadError;
use crate::planner::MAX_CHUNKS;
use crate::progress::ProgressCallback;

pub(crate) const DEFAULT_USER_AGENT: &str = concat!("rget/", env!("CARGO_PKG_VERSION"));
const DEFAULT_CONCURRENCY: u32 = 4;
const DEFAULT_MAX_REDIRECTS: u32 = 10;
const DEFAULT_MAX_MEMORY: u64 = 256 * 1024 * 1024;

/// Options accepted by every download entry point.
///
/// The struct is typed, so unrepresentable options cannot reach the engine;
/// inconsistent values are rejected with a `Config` error when the manager
/// is built. Out-of-range counts are clamped rather than rejected.
#[derive(Clone)]
pub struct DownloadOptions {
    /// Value of the `User-Agent` request header
    pub user_agent: String,
    /// Whole-call deadline; surfaces as a `Timeout` error when exceeded
    pub timeout: Option<Duration>,
    /// When false, refuse to replace an existing destination
    pub overwrite_existing: bool,
    /// Create missing parent directories of the destination
    pub create_dirs: bool,
    /// Enable the sidecar-manifest resume logic
    pub resume: bool,
    /// Worker pool bound, clamped to `[1, 32]`
    pub max_concurrency: u32,
    /// Overrides the planner's chunk count, clamped to `[1, 32]`.
    /// Forces chunked mode even below the automatic-split threshold.
    pub chunk_count: Option<u32>,
    /// Whole-call retries on transient errors, on top of the per-worker
    /// retry policy
    pub retry_attempts: u32,
    /// Shared bandwidth cap in bytes/sec; 0 means unlimited
    pub max_rate: u64,
    /// Extra request headers, sent in order
    pub headers: Vec<(String, String)>,
    /// Redirect hop limit; 0 disables following redirects
    pub max_redirects: u32,
    /// Disable TLS certificate verification
    pub insecure_skip_verify: bool,
    /// HTTP proxy for all requests
    pub proxy_url: Option<String>,
    /// Ceiling for `download_to_memory`
    pub max_memory_size: u64,
    /// Receives throttled [`crate::ProgressSnapshot`] updates
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: None,
            overwrite_existing: true,
            create_dirs: false,
            resume: false,
            max_concurrency: DEFAULT_CONCURRENCY,
            chunk_count: None,
            retry_attempts: 0,
            max_rate: 0,
            headers: Vec::new(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            insecure_skip_verify: false,
            proxy_url: None,
            max_memory_size: DEFAULT_MAX_MEMORY,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("user_agent", &self.user_agent)
            .field("timeout", &self.timeout)
            .field("overwrite_existing", &self.overwrite_existing)
            .field("create_dirs", &self.create_dirs)
            .field("resume", &self.resume)
            .field("max_concurrency", &self.max_concurrency)
            .field("chunk_count", &self.chunk_count)
            .field("retry_attempts", &self.retry_attempts)
            .field("max_rate", &self.max_rate)
            .field("headers", &self.headers)
            .field("max_redirects", &self.max_redirects)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("proxy_url", &self.proxy_url)
            .field("max_memory_size", &self.max_memory_size)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

impl DownloadOptions {
    /// Normalizes counts and rejects inconsistent values.
    pub(crate) fn validated(mut self) -> Result<Self, DownloadError> {
        self.max_concurrency = self.max_concurrency.clamp(1, MAX_CHUNKS);
        self.chunk_count = self.chunk_count.map(|c| c.clamp(1, MAX_CHUNKS));

        if self.user_agent.is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_string();
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(DownloadError::config("timeout must be greater than zero"));
            }
        }
        if self.max_memory_size == 0 {
            return Err(DownloadError::config(
                "max_memory_size must be greater than zero",
            ));
        }
        if let Some(proxy) = &self.proxy_url {
            url::Url::parse(proxy).map_err(|e| {
                DownloadError::config(format!("invalid proxy URL {proxy}")).with_source(e)
            })?;
        }
        for (name, _) in &self.headers {
            if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == ':') {
                return Err(DownloadError::config(format!(
                    "invalid header name {name:?}"
                )));
            }
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let options = DownloadOptions::default();
        assert_eq!(options.max_concurrency, 4);
        assert_eq!(options.max_rate, 0);
        assert_eq!(options.chunk_count, None);
        assert!(options.overwrite_existing);
        assert!(!options.resume);
        assert!(options.user_agent.starts_with("rget/"));
    }

    #[test]
    fn counts_are_clamped_not_rejected() {
        let options = DownloadOptions {
            max_concurrency: 0,
            chunk_count: Some(1000),
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(options.max_concurrency, 1);
        assert_eq!(options.chunk_count, Some(32));

        let options = DownloadOptions {
            max_concurrency: 99,
            ..Default::default()
        }
        .validated()
        .unwrap();
        assert_eq!(options.max_concurrency, 32);
    }

    #[test]
    fn inconsistent_values_are_config_errors() {
        use crate::error::ErrorKind;

        let err = DownloadOptions {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        }
        .validated()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = DownloadOptions {
            proxy_url: Some("not a url".to_string()),
            ..Default::default()
        }
        .validated()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = DownloadOptions {
            headers: vec![("Bad Header".to_string(), "v".to_string())],
            ..Default::default()
        }
        .validated()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
