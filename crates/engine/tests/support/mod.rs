//! Shared test support: a Range-aware mock origin.
//!
//! wiremock's built-in matchers cover fixed responses; serving arbitrary
//! `Range` requests against one payload needs a custom responder.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::matchers::path;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Tunable behavior of the mock origin
pub struct OriginBehavior {
    pub body: Vec<u8>,
    /// Advertise and honor `Range` requests
    pub support_ranges: bool,
    pub etag: Option<String>,
    /// Delay applied to every response
    pub delay: Option<Duration>,
    /// Answer this many leading GETs with 500 before behaving
    pub fail_first: usize,
    /// Answer 416 to any range that does not start at byte 0
    pub reject_resumed_ranges: bool,
}

impl Default for OriginBehavior {
    fn default() -> Self {
        Self {
            body: Vec::new(),
            support_ranges: true,
            etag: Some("\"test-etag-1\"".to_string()),
            delay: None,
            fail_first: 0,
            reject_resumed_ranges: false,
        }
    }
}

struct OriginState {
    behavior: Mutex<OriginBehavior>,
    gets: AtomicUsize,
    ranges: Mutex<Vec<(u64, Option<u64>)>>,
}

/// Mock origin mounted on one path of a [`MockServer`]
#[derive(Clone)]
pub struct Origin {
    state: Arc<OriginState>,
}

impl Origin {
    pub async fn mount(server: &MockServer, url_path: &str, behavior: OriginBehavior) -> Self {
        let origin = Self {
            state: Arc::new(OriginState {
                behavior: Mutex::new(behavior),
                gets: AtomicUsize::new(0),
                ranges: Mutex::new(Vec::new()),
            }),
        };
        Mock::given(path(url_path))
            .respond_with(origin.clone())
            .mount(server)
            .await;
        origin
    }

    /// Number of GET requests served so far.
    pub fn get_count(&self) -> usize {
        self.state.gets.load(Ordering::SeqCst)
    }

    /// `(start, end)` of every `Range` header seen on a GET, in order.
    pub fn served_ranges(&self) -> Vec<(u64, Option<u64>)> {
        self.state.ranges.lock().unwrap().clone()
    }

    pub fn reset_counters(&self) {
        self.state.gets.store(0, Ordering::SeqCst);
        self.state.ranges.lock().unwrap().clear();
    }

    /// Swaps the payload and validator, simulating the origin changing
    /// between two calls.
    pub fn replace_content(&self, body: Vec<u8>, etag: &str) {
        let mut behavior = self.state.behavior.lock().unwrap();
        behavior.body = body;
        behavior.etag = Some(etag.to_string());
    }
}

impl Respond for Origin {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let behavior = self.state.behavior.lock().unwrap();
        let len = behavior.body.len() as u64;

        let mut template = if request.method.as_str() == "HEAD" {
            // the body is never sent for HEAD, but it makes the server
            // derive the right Content-Length
            let mut template = ResponseTemplate::new(200).set_body_bytes(behavior.body.clone());
            if behavior.support_ranges {
                template = template.insert_header("accept-ranges", "bytes");
            }
            template
        } else {
            let served = self.state.gets.fetch_add(1, Ordering::SeqCst);
            if served < behavior.fail_first {
                return ResponseTemplate::new(500);
            }

            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_range);

            if let Some((start, end)) = range {
                self.state.ranges.lock().unwrap().push((start, end));
            }

            match range {
                Some((start, end)) if behavior.support_ranges => {
                    if start >= len || (behavior.reject_resumed_ranges && start > 0) {
                        ResponseTemplate::new(416)
                            .insert_header("content-range", format!("bytes */{len}").as_str())
                    } else {
                        let end = end.map(|e| e.min(len - 1)).unwrap_or(len - 1);
                        let slice = behavior.body[start as usize..=end as usize].to_vec();
                        ResponseTemplate::new(206)
                            .set_body_bytes(slice)
                            .insert_header(
                                "content-range",
                                format!("bytes {start}-{end}/{len}").as_str(),
                            )
                    }
                }
                // no Range, or an origin that ignores it: the full payload
                _ => ResponseTemplate::new(200).set_body_bytes(behavior.body.clone()),
            }
        };

        template = template.insert_header("content-type", "application/octet-stream");
        if let Some(etag) = &behavior.etag {
            template = template.insert_header("etag", etag.as_str());
        }
        if let Some(delay) = behavior.delay {
            template = template.set_delay(delay);
        }
        template
    }
}

/// Parses `bytes=a-b` / `bytes=a-` range headers.
fn parse_range(value: &str) -> Option<(u64, Option<u64>)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

/// Deterministic non-repeating payload of `len` bytes.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
