//! Integration tests for the download engine against a local mock origin

mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use engine::{CancellationToken, DownloadManager, DownloadOptions, ErrorKind};
use support::{patterned, Origin, OriginBehavior};
use tempfile::TempDir;
use tokio::time::Instant;
use wiremock::MockServer;

const MB: usize = 1024 * 1024;

async fn serve(behavior: OriginBehavior) -> (MockServer, Origin, String) {
    let server = MockServer::start().await;
    let origin = Origin::mount(&server, "/file.bin", behavior).await;
    let url = format!("{}/file.bin", server.uri());
    (server, origin, url)
}

#[tokio::test]
async fn test_download_small_file_byte_exact() {
    let payload = patterned(1000);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();

    let outcome = engine::download_to_path(&cancel, &url, &dest, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.bytes_downloaded, 1000);
    assert_eq!(outcome.retries, 0);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
}

#[tokio::test]
async fn test_forced_chunked_small_file() {
    // a 1000-byte file normally rides a single stream; an explicit chunk
    // override splits it into four 250-byte ranges
    let payload = patterned(1000);
    let (_server, origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        chunk_count: Some(4),
        max_concurrency: 4,
        ..Default::default()
    };

    let outcome = engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap();

    assert_eq!(outcome.bytes_downloaded, 1000);
    assert_eq!(outcome.retries, 0);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);

    let mut ranges = origin.served_ranges();
    ranges.sort();
    assert_eq!(
        ranges,
        vec![
            (0, Some(249)),
            (250, Some(499)),
            (500, Some(749)),
            (750, Some(999)),
        ]
    );
    // temp state is gone after commit
    assert!(!dir.path().join("out.bin.chunks").exists());
}

#[tokio::test]
async fn test_uneven_payload_chunking() {
    // 1003 bytes over 4 chunks: 251 + 251 + 251 + 250
    let payload = patterned(1003);
    let (_server, origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        chunk_count: Some(4),
        ..Default::default()
    };

    engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);

    let mut ranges = origin.served_ranges();
    ranges.sort();
    assert_eq!(
        ranges,
        vec![
            (0, Some(250)),
            (251, Some(501)),
            (502, Some(752)),
            (753, Some(1002)),
        ]
    );
}

#[tokio::test]
async fn test_byte_accuracy_across_sizes_and_concurrency() {
    for size in [1usize, MB - 1, MB, MB + 1, 5 * MB] {
        let payload = patterned(size);
        let (_server, _origin, url) = serve(OriginBehavior {
            body: payload.clone(),
            ..Default::default()
        })
        .await;

        for concurrency in [1u32, 4, 8] {
            let dir = TempDir::new().unwrap();
            let dest = dir.path().join("out.bin");
            let cancel = CancellationToken::new();
            let options = DownloadOptions {
                max_concurrency: concurrency,
                ..Default::default()
            };

            engine::download_to_path(&cancel, &url, &dest, options)
                .await
                .unwrap_or_else(|e| panic!("size={size} concurrency={concurrency}: {e}"));

            let written = tokio::fs::read(&dest).await.unwrap();
            assert_eq!(
                written, payload,
                "content mismatch at size={size} concurrency={concurrency}"
            );
        }
    }
}

#[tokio::test]
async fn test_empty_file() {
    let (_server, _origin, url) = serve(OriginBehavior {
        body: Vec::new(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();

    let outcome = engine::download_to_path(&cancel, &url, &dest, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.bytes_downloaded, 0);
    assert_eq!(tokio::fs::metadata(&dest).await.unwrap().len(), 0);
}

#[tokio::test]
async fn test_fallback_to_single_stream_without_range_support() {
    let payload = patterned(3 * MB);
    let (_server, origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        support_ranges: false,
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        max_concurrency: 8,
        ..Default::default()
    };

    engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap();

    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
    // no ranged request ever went out
    assert!(origin.served_ranges().is_empty());
    assert_eq!(origin.get_count(), 1);
}

#[tokio::test]
async fn test_no_retry_on_404() {
    let server = MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::any())
        .respond_with(wiremock::ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let url = format!("{}/missing.bin", server.uri());

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        retry_attempts: 3,
        ..Default::default()
    };

    let err = engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Client);
    assert_eq!(err.status(), Some(404));
    // probe (HEAD + ranged GET fallback) and one data GET; no retries
    let requests = server.received_requests().await.unwrap();
    let data_gets = requests
        .iter()
        .filter(|r| r.method.as_str() == "GET" && !r.headers.contains_key("range"))
        .count();
    assert_eq!(data_gets, 1, "a 404 must not be retried");
}

#[tokio::test]
async fn test_retries_on_transient_500() {
    let payload = patterned(1000);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        fail_first: 2,
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();

    let outcome = engine::download_to_path(&cancel, &url, &dest, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.retries, 2);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
}

#[tokio::test]
async fn test_rate_limit_paces_the_transfer() {
    // 8 KiB at 4 KiB/s: the burst covers the first half, the rest takes
    // about a second
    let payload = patterned(8 * 1024);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        max_rate: 4 * 1024,
        ..Default::default()
    };

    let started = Instant::now();
    engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(800),
        "finished too fast for the rate limit: {elapsed:?}"
    );
    assert!(
        elapsed <= Duration::from_secs(5),
        "rate limiter overshot: {elapsed:?}"
    );
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
}

#[tokio::test]
async fn test_progress_is_monotonic_and_reaches_total() {
    let payload = patterned(5 * MB);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();

    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let callback = {
        let seen = Arc::clone(&seen);
        Arc::new(move |snapshot: &engine::ProgressSnapshot| {
            seen.lock().unwrap().push(snapshot.downloaded_bytes);
        }) as engine::ProgressCallback
    };

    let options = DownloadOptions {
        chunk_count: Some(8),
        progress_callback: Some(callback),
        ..Default::default()
    };

    engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(
        seen.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress went backwards: {seen:?}"
    );
    assert_eq!(*seen.last().unwrap(), 5 * MB as u64);
}

#[tokio::test]
async fn test_download_to_memory() {
    let payload = patterned(64 * 1024);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let cancel = CancellationToken::new();
    let (bytes, outcome) = engine::download_to_memory(&cancel, &url, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(bytes, payload);
    assert_eq!(outcome.bytes_downloaded, 64 * 1024);
}

#[tokio::test]
async fn test_download_to_memory_respects_the_cap() {
    let payload = patterned(64 * 1024);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload,
        ..Default::default()
    })
    .await;

    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        max_memory_size: 16 * 1024,
        ..Default::default()
    };

    let err = engine::download_to_memory(&cancel, &url, options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_download_to_writer_is_single_stream() {
    let payload = patterned(2 * MB);
    let (_server, origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let cancel = CancellationToken::new();
    let mut sink: Vec<u8> = Vec::new();
    let outcome = engine::download_to_writer(&cancel, &url, &mut sink, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(sink, payload);
    assert_eq!(outcome.bytes_downloaded, 2 * MB as u64);
    // the writer path never splits into ranged chunks
    assert!(origin.served_ranges().is_empty());
}

#[tokio::test]
async fn test_probe_reports_origin_capabilities() {
    let payload = patterned(12345);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload,
        etag: Some("\"probe-etag\"".to_string()),
        ..Default::default()
    })
    .await;

    let cancel = CancellationToken::new();
    let descriptor = engine::probe(&cancel, &url, DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(descriptor.total_bytes, Some(12345));
    assert!(descriptor.supports_ranges);
    assert_eq!(descriptor.etag.as_deref(), Some("\"probe-etag\""));
    assert_eq!(
        descriptor.content_type.as_deref(),
        Some("application/octet-stream")
    );
}

#[tokio::test]
async fn test_refuses_existing_destination_without_overwrite() {
    let payload = patterned(100);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload,
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    tokio::fs::write(&dest, b"precious").await.unwrap();

    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        overwrite_existing: false,
        ..Default::default()
    };

    let err = engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"precious");
}

#[tokio::test]
async fn test_create_dirs_option() {
    let payload = patterned(100);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("a/b/out.bin");
    let cancel = CancellationToken::new();

    let err = engine::download_to_path(&cancel, &url, &dest, DownloadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::FileNotFound);

    let options = DownloadOptions {
        create_dirs: true,
        ..Default::default()
    };
    engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap();
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
}

#[tokio::test]
async fn test_invalid_urls_fail_before_io() {
    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();

    let err = engine::download_to_path(
        &cancel,
        "ftp://example.com/f.bin",
        &dest,
        DownloadOptions::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUrl);

    let err =
        engine::download_to_path(&cancel, "not a url", &dest, DownloadOptions::default())
            .await
            .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidUrl);
}

#[tokio::test]
async fn test_cancellation_is_prompt() {
    // a rate limit keeps the transfer running long enough to cancel into it
    let payload = patterned(MB);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload,
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        max_rate: 64 * 1024,
        ..Default::default()
    };

    let task = {
        let cancel = cancel.clone();
        let url = url.clone();
        tokio::spawn(async move { engine::download_to_path(&cancel, &url, &dest, options).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();

    let result = task.await.unwrap();
    let reaction = cancelled_at.elapsed();

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    assert!(
        reaction <= Duration::from_secs(2),
        "cancellation took {reaction:?}"
    );
}

#[tokio::test]
async fn test_deadline_surfaces_as_timeout() {
    let payload = patterned(MB);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload,
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let dest = dir.path().join("out.bin");
    let cancel = CancellationToken::new();
    let options = DownloadOptions {
        max_rate: 64 * 1024,
        timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    };

    let err = engine::download_to_path(&cancel, &url, &dest, options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
#[ignore] // timing comparison, run manually
async fn test_parallelism_beats_single_stream_on_slow_origin() {
    let payload = patterned(10 * MB);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload,
        delay: Some(Duration::from_millis(5)),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();

    let started = Instant::now();
    engine::download_to_path(
        &cancel,
        &url,
        &dir.path().join("serial.bin"),
        DownloadOptions {
            chunk_count: Some(8),
            max_concurrency: 1,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let serial = started.elapsed();

    let started = Instant::now();
    engine::download_to_path(
        &cancel,
        &url,
        &dir.path().join("parallel.bin"),
        DownloadOptions {
            chunk_count: Some(8),
            max_concurrency: 8,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let parallel = started.elapsed();

    assert!(
        parallel < serial,
        "expected parallel ({parallel:?}) to beat serial ({serial:?})"
    );
}

#[tokio::test]
async fn test_manager_reuse_across_calls() {
    let payload = patterned(1000);
    let (_server, _origin, url) = serve(OriginBehavior {
        body: payload.clone(),
        ..Default::default()
    })
    .await;

    let dir = TempDir::new().unwrap();
    let cancel = CancellationToken::new();
    let manager = DownloadManager::new(DownloadOptions::default()).unwrap();

    for name in ["a.bin", "b.bin"] {
        let dest = dir.path().join(name);
        manager.download_to_path(&cancel, &url, &dest).await.unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), payload);
    }
}
