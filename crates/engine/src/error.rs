//! Download error taxonomy

use std::fmt;
use std::io;
use std::path::Path;

use thiserror::Error;

/// Classified failure category for a download call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// URL scheme or syntax rejected before any I/O
    InvalidUrl,
    /// DNS, connect, TLS, or stream read/write failure
    Network,
    /// Request or whole-call deadline exceeded
    Timeout,
    /// HTTP 4xx from the origin
    Client,
    /// HTTP 5xx from the origin (plus 429/503 throttling responses)
    Server,
    /// HTTP 401: missing or rejected credentials
    AuthenticationFailed,
    /// Local filesystem permission error
    PermissionDenied,
    /// Local path missing
    FileNotFound,
    /// Local write failed for lack of disk space
    InsufficientSpace,
    /// Size or hash mismatch detected in the resume path
    CorruptedData,
    /// Caller input failed a constraint
    Validation,
    /// The call's cancellation token fired
    Cancelled,
    /// Library configuration inconsistency
    Config,
    /// None of the above
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidUrl => "invalid URL",
            ErrorKind::Network => "network error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Client => "client error",
            ErrorKind::Server => "server error",
            ErrorKind::AuthenticationFailed => "authentication failed",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::FileNotFound => "file not found",
            ErrorKind::InsufficientSpace => "insufficient disk space",
            ErrorKind::CorruptedData => "corrupted data",
            ErrorKind::Validation => "validation error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "configuration error",
            ErrorKind::Unknown => "unknown error",
        };
        f.write_str(name)
    }
}

/// Error surfaced by the download engine.
///
/// Carries a classified [`ErrorKind`], a human-readable message, and, when
/// available, the URL involved, the HTTP status, and the underlying cause.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DownloadError {
    kind: ErrorKind,
    message: String,
    url: Option<String>,
    status: Option<u16>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DownloadError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            url: None,
            status: None,
            source: None,
        }
    }

    pub fn invalid_url(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUrl, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptedData, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "download cancelled")
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// True for failures that a retry has a chance of fixing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }

    /// Maps an HTTP status to an error. `resumed` is true when the request
    /// carried a `Range` header with a non-zero start, which changes how
    /// 416 is classified.
    pub fn from_status(status: u16, url: &str, resumed: bool) -> Self {
        let kind = match status {
            401 => ErrorKind::AuthenticationFailed,
            416 if resumed => ErrorKind::CorruptedData,
            429 | 503 => ErrorKind::Server,
            400..=499 => ErrorKind::Client,
            500..=599 => ErrorKind::Server,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, format!("origin returned HTTP {status}"))
            .with_url(url)
            .with_status(status)
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), url, false).with_source(err);
        }
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if err.is_builder() {
            ErrorKind::Config
        } else {
            ErrorKind::Network
        };
        Self::new(kind, err.to_string()).with_url(url).with_source(err)
    }

    pub(crate) fn from_io(err: io::Error, path: &Path) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            // ENOSPC has no stable io::ErrorKind mapping on all toolchains
            _ if err.raw_os_error() == Some(28) => ErrorKind::InsufficientSpace,
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, format!("{}: {}", path.display(), err)).with_source(err)
    }
}
