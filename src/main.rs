//! Rangeloader - resumable multi-range downloader
//!
//! Headless front end: downloads one file (or one HLS segment list) and
//! prints progress until the task ends.

use anyhow::{bail, Context, Result};
use clap::Parser;
use rangeloader::downloader::progress::State;
use rangeloader::utils::{init_logging, Settings};
use rangeloader::{DownloadParam, MediaSegment, SegmentKey, TaskEvent};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "rangeloader", version, about)]
struct Args {
    /// URL to download (the playlist URL when --segments is given)
    url: String,

    /// Output file name (derived from the URL when omitted)
    #[arg(long)]
    name: Option<String>,

    /// Output directory
    #[arg(long)]
    dir: Option<PathBuf>,

    /// JSON settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bytes per range request
    #[arg(long)]
    range_size: Option<u64>,

    /// Simultaneous range fetches
    #[arg(long)]
    concurrency: Option<usize>,

    /// File listing HLS segment URIs, one per line, in playlist order
    #[arg(long)]
    segments: Option<PathBuf>,

    /// AES-128 key for the segments, as hex
    #[arg(long, requires = "segments")]
    key: Option<String>,

    /// IV for the segments, as hex (defaults to zero)
    #[arg(long, requires = "key")]
    iv: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?,
        None => Settings::default(),
    };
    if let Some(range_size) = args.range_size {
        settings.range_size = range_size;
    }
    if let Some(concurrency) = args.concurrency {
        settings.range_concurrency = concurrency;
    }
    let settings = settings.sanitized();

    let manager = settings.build_manager()?;
    let mut config = settings.download_config(&manager);
    if let Some(key) = &args.key {
        let iv = args.iv.as_deref().unwrap_or("00000000000000000000000000000000");
        config = config.with_key(SegmentKey::from_hex(key, iv)?);
    }

    let save_path = args
        .dir
        .clone()
        .unwrap_or_else(|| settings.download_location.clone());
    let mut param = DownloadParam::new(&args.url, args.name.clone().unwrap_or_default(), save_path);
    if let Some(list) = &args.segments {
        param = param.with_segments(read_segment_list(list).await?);
    }

    let task = rangeloader::submit(param, config).await?;
    info!(task_id = task.id(), "Saving to {}", task.param().target().display());

    let mut events = task.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let TaskEvent::Progress { progress, .. } = event {
                if progress.is_chunked {
                    eprint!("\r{}          ", progress.downloaded_str());
                } else {
                    eprint!(
                        "\r{} / {} ({})          ",
                        progress.downloaded_str(),
                        progress.total_str(),
                        progress.percent_str()
                    );
                }
            }
        }
    });

    let state = tokio::select! {
        state = task.suspend_start() => state,
        _ = tokio::signal::ctrl_c() => {
            task.stop().await;
            let mut rx = task.watch_state();
            let ended = rx.wait_for(|s| s.is_terminal()).await.map(|s| s.clone());
            ended.unwrap_or(State::Stopped)
        }
    };
    printer.abort();
    eprintln!();

    match state {
        State::Succeed => {
            println!("Saved {}", task.param().target().display());
            Ok(())
        }
        State::Stopped => {
            println!("Stopped; run the same command again to resume");
            Ok(())
        }
        State::Failed(reason) => bail!("download failed: {}", reason),
        other => bail!("download ended in unexpected state {}", other),
    }
}

async fn read_segment_list(path: &Path) -> Result<Vec<MediaSegment>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let segments: Vec<MediaSegment> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(MediaSegment::new)
        .collect();
    if segments.is_empty() {
        bail!("{} lists no segments", path.display());
    }
    Ok(segments)
}
