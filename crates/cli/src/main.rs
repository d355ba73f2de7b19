//! rget - command-line front end for the download engine

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use engine::{
    CancellationToken, DownloadManager, DownloadOptions, ErrorKind, ProgressSnapshot,
};
use indicatif::{ProgressBar, ProgressStyle};

/// Exit code for a caller-interrupted download (128 + SIGINT).
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "rget", version, about = "Concurrent ranged file downloader")]
struct Args {
    /// URL to download
    url: String,

    /// Output file (defaults to the name in the URL path)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of parallel connections (1-32)
    #[arg(short = 'c', long, default_value_t = 4)]
    concurrency: u32,

    /// Override the automatic chunk count (1-32)
    #[arg(long)]
    chunks: Option<u32>,

    /// Resume a previously interrupted download
    #[arg(short, long)]
    resume: bool,

    /// Bandwidth limit in bytes per second (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    rate: u64,

    /// Whole-call timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Retries of the whole call on transient failures
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Extra request header, NAME:VALUE (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Refuse to replace an existing output file
    #[arg(long)]
    no_clobber: bool,

    /// Create missing parent directories of the output path
    #[arg(long)]
    create_dirs: bool,

    /// Maximum redirect hops (0 disables redirects)
    #[arg(long, default_value_t = 10)]
    max_redirects: u32,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,

    /// HTTP proxy URL
    #[arg(long)]
    proxy: Option<String>,

    /// User-Agent header value
    #[arg(long)]
    user_agent: Option<String>,

    /// Probe the URL and print what the origin supports, without downloading
    #[arg(long)]
    probe: bool,

    /// Disable the progress bar
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rget: {e:#}");
            let cancelled = e
                .downcast_ref::<engine::DownloadError>()
                .is_some_and(|e| e.kind() == ErrorKind::Cancelled);
            if cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let bar = (!args.quiet && !args.probe).then(progress_bar);
    let options = build_options(&args, bar.clone())?;
    let manager = DownloadManager::new(options)?;

    // ctrl-c cancels the shared token; the engine unwinds and preserves
    // resumable state before returning
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    if args.probe {
        let origin = manager.probe(&cancel, &args.url).await?;
        println!("final URL:      {}", origin.final_url);
        println!(
            "size:           {}",
            origin
                .total_bytes
                .map(|t| format!("{t} bytes ({})", human_bytes(t as f64)))
                .unwrap_or_else(|| "unknown".to_string())
        );
        println!("range support:  {}", origin.supports_ranges);
        println!(
            "content type:   {}",
            origin.content_type.as_deref().unwrap_or("unknown")
        );
        println!("etag:           {}", origin.etag.as_deref().unwrap_or("-"));
        println!(
            "last modified:  {}",
            origin.last_modified.as_deref().unwrap_or("-")
        );
        return Ok(());
    }

    let dest = match &args.output {
        Some(path) => path.clone(),
        None => PathBuf::from(filename_from_url(&args.url)?),
    };

    let result = manager.download_to_path(&cancel, &args.url, &dest).await;
    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }
    let outcome = result?;

    let secs = outcome.duration.as_secs_f64();
    let speed = if secs > 0.0 {
        outcome.bytes_downloaded as f64 / secs
    } else {
        0.0
    };
    println!(
        "{} -> {} ({} in {:.1}s, {}/s{})",
        outcome.final_url,
        dest.display(),
        human_bytes(outcome.bytes_downloaded as f64),
        secs,
        human_bytes(speed),
        if outcome.retries > 0 {
            format!(", {} retries", outcome.retries)
        } else {
            String::new()
        }
    );
    Ok(())
}

fn build_options(args: &Args, bar: Option<ProgressBar>) -> anyhow::Result<DownloadOptions> {
    let mut headers = Vec::new();
    for raw in &args.headers {
        let (name, value) = raw
            .split_once(':')
            .with_context(|| format!("header {raw:?} is not NAME:VALUE"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let progress_callback = bar.map(|bar| {
        Arc::new(move |snapshot: &ProgressSnapshot| {
            if let Some(total) = snapshot.total_bytes {
                bar.set_length(total);
            }
            bar.set_position(snapshot.downloaded_bytes);
            bar.set_message(format!("{}/s", human_bytes(snapshot.speed_bps)));
        }) as engine::ProgressCallback
    });

    let mut options = DownloadOptions {
        max_concurrency: args.concurrency,
        chunk_count: args.chunks,
        resume: args.resume,
        max_rate: args.rate,
        timeout: args.timeout.map(Duration::from_secs),
        retry_attempts: args.retries,
        headers,
        overwrite_existing: !args.no_clobber,
        create_dirs: args.create_dirs,
        max_redirects: args.max_redirects,
        insecure_skip_verify: args.insecure,
        proxy_url: args.proxy.clone(),
        progress_callback,
        ..Default::default()
    };
    if let Some(user_agent) = &args.user_agent {
        options.user_agent = user_agent.clone();
    }
    Ok(options)
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} {msg} eta {eta}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Last path segment of the URL, or "index.html" for a bare host.
fn filename_from_url(url: &str) -> anyhow::Result<String> {
    let parsed = url::Url::parse(url).with_context(|| format!("invalid URL {url:?}"))?;
    let name = parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .unwrap_or("");
    if name.is_empty() {
        Ok("index.html".to_string())
    } else {
        Ok(name.to_string())
    }
}

fn human_bytes(value: f64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = value;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", value as u64, UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
