//! HTTP client construction and origin probing

use std::time::Duration;

use reqwest::header::{HeaderMap, RANGE};
use reqwest::redirect::Policy;
use reqwest::{Client, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::DownloadError;
use crate::options::DownloadOptions;

/// Probe requests give up after this long; the main transfer has its own
/// whole-call deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// What probing the URL revealed about the origin
#[derive(Debug, Clone)]
pub struct OriginDescriptor {
    /// URL after following redirects
    pub final_url: String,
    /// Declared size; `None` when the origin did not say
    pub total_bytes: Option<u64>,
    /// Origin advertised `Accept-Ranges: bytes` or honored a ranged probe
    pub supports_ranges: bool,
    /// `ETag` validator, when present
    pub etag: Option<String>,
    /// `Last-Modified` validator, when present
    pub last_modified: Option<String>,
    /// Declared `Content-Type`, when present
    pub content_type: Option<String>,
}

/// Builds the per-manager client: one connection pool shared by all
/// workers of calls made through that manager.
pub(crate) fn build_client(options: &DownloadOptions) -> Result<Client, DownloadError> {
    let redirects = if options.max_redirects == 0 {
        Policy::none()
    } else {
        Policy::limited(options.max_redirects as usize)
    };

    let mut builder = Client::builder()
        .user_agent(&options.user_agent)
        .redirect(redirects)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30));

    if options.insecure_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(proxy) = &options.proxy_url {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
            DownloadError::config(format!("invalid proxy URL {proxy}")).with_source(e)
        })?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| DownloadError::config("failed to build HTTP client").with_source(e))
}

/// Rejects anything that is not an absolute http(s) URL before any I/O.
pub(crate) fn validate_url(raw: &str) -> Result<(), DownloadError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| DownloadError::invalid_url(format!("invalid URL {raw:?}")).with_source(e))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(
            DownloadError::invalid_url(format!("unsupported URL scheme {other:?}")).with_url(raw),
        ),
    }
}

pub(crate) fn apply_headers(
    mut request: RequestBuilder,
    headers: &[(String, String)],
) -> RequestBuilder {
    for (name, value) in headers {
        request = request.header(name, value);
    }
    request
}

/// Probes the origin: HEAD first, falling back to a one-byte ranged GET
/// when HEAD is rejected. A fully unreachable probe still yields a
/// descriptor (no range support, unknown size) so the caller can attempt a
/// plain single-stream GET.
pub(crate) async fn probe_origin(
    client: &Client,
    url: &str,
    headers: &[(String, String)],
    cancel: &CancellationToken,
) -> Result<OriginDescriptor, DownloadError> {
    let head = apply_headers(client.head(url), headers).timeout(PROBE_TIMEOUT);
    let head = send_cancellable(head, cancel, url).await;

    match head {
        Ok(response) if response.status().is_success() => {
            let descriptor = descriptor_from_head(&response);
            debug!(url, ?descriptor, "probed via HEAD");
            Ok(descriptor)
        }
        Err(e) if e.kind() == crate::error::ErrorKind::Cancelled => Err(e),
        other => {
            if let Ok(response) = &other {
                debug!(url, status = %response.status(), "HEAD rejected, probing with ranged GET");
            } else {
                debug!(url, "HEAD failed, probing with ranged GET");
            }
            probe_with_ranged_get(client, url, headers, cancel).await
        }
    }
}

async fn probe_with_ranged_get(
    client: &Client,
    url: &str,
    headers: &[(String, String)],
    cancel: &CancellationToken,
) -> Result<OriginDescriptor, DownloadError> {
    let request = apply_headers(client.get(url), headers)
        .header(RANGE, "bytes=0-0")
        .timeout(PROBE_TIMEOUT);

    let response = match send_cancellable(request, cancel, url).await {
        Ok(response) => response,
        Err(e) if e.kind() == crate::error::ErrorKind::Cancelled => return Err(e),
        Err(e) => {
            // both probes failed; report what little we know
            debug!(url, error = %e, "ranged probe failed; origin capabilities unknown");
            return Ok(OriginDescriptor {
                final_url: url.to_string(),
                total_bytes: None,
                supports_ranges: false,
                etag: None,
                last_modified: None,
                content_type: None,
            });
        }
    };

    let status = response.status().as_u16();
    let supports_ranges = status == 206;
    let total_bytes = if supports_ranges {
        header_str(response.headers(), "content-range").and_then(parse_content_range_total)
    } else {
        content_length_of(&response)
    };

    Ok(OriginDescriptor {
        final_url: response.url().to_string(),
        total_bytes,
        supports_ranges,
        etag: header_str(response.headers(), "etag"),
        last_modified: header_str(response.headers(), "last-modified"),
        content_type: header_str(response.headers(), "content-type"),
    })
}

fn descriptor_from_head(response: &Response) -> OriginDescriptor {
    let supports_ranges = header_str(response.headers(), "accept-ranges")
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    OriginDescriptor {
        final_url: response.url().to_string(),
        total_bytes: content_length_of(response),
        supports_ranges,
        etag: header_str(response.headers(), "etag"),
        last_modified: header_str(response.headers(), "last-modified"),
        content_type: header_str(response.headers(), "content-type"),
    }
}

pub(crate) async fn send_cancellable(
    request: RequestBuilder,
    cancel: &CancellationToken,
    url: &str,
) -> Result<Response, DownloadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DownloadError::cancelled()),
        result = request.send() => result.map_err(|e| DownloadError::from_reqwest(e, url)),
    }
}

/// `Content-Length` parsed by hand as well; `reqwest::Response::content_length`
/// is absent under some transfer encodings.
pub(crate) fn content_length_of(response: &Response) -> Option<u64> {
    header_str(response.headers(), "content-length")
        .and_then(|v| v.parse().ok())
        .or_else(|| response.content_length())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Total size out of a `Content-Range: bytes 0-0/1234` header; `*` means
/// the origin does not know.
fn parse_content_range_total(value: String) -> Option<u64> {
    value.rsplit('/').next().and_then(|total| total.parse().ok())
}
