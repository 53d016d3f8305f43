//! Streaming a single range, a whole file, or one HLS segment to disk

use crate::downloader::crypto;
use crate::downloader::layout::{FileRegion, RegionFile};
use crate::downloader::probe::parse_content_range;
use crate::downloader::progress::Progress;
use crate::downloader::retry::RetryPolicy;
use crate::downloader::segment::{ByteRange, SegmentJob};
use crate::utils::error::DownloadError;
use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

async fn send(
    request: reqwest::RequestBuilder,
    cancel: &CancellationToken,
) -> Result<Response, DownloadError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        response = request.send() => Ok(response?),
    }
}

/// Fetch `range` into its region of `file`, retrying transient failures.
///
/// Bytes credited to `progress` by a failed attempt are taken back before the
/// next one, so the counter never includes data that will be rewritten.
pub async fn fetch_range(
    client: &Client,
    url: &str,
    range: ByteRange,
    file: &RegionFile,
    progress: &Progress,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let mut region = file.acquire_region(range.start, range.len)?;
    let what = format!("range {}", range.index);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match range_attempt(client, url, &range, &mut region, progress, cancel).await {
            Ok(()) => {
                trace!(index = range.index, bytes = range.len, "Range complete");
                return Ok(());
            }
            Err(err) => {
                progress.sub(region.written());
                region.rewind();
                retry
                    .wait_before_retry(&what, attempt, err.for_chunk(range.index), cancel)
                    .await?;
            }
        }
    }
}

async fn range_attempt(
    client: &Client,
    url: &str,
    range: &ByteRange,
    region: &mut FileRegion,
    progress: &Progress,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let response = send(client.get(url).header(RANGE, range.header_value()), cancel).await?;

    // a 200 carries the whole body; skip up to our offset
    let mut skip = match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let start = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .map(|cr| cr.start);
            if start != Some(range.start) {
                return Err(DownloadError::ChunkFetch {
                    index: range.index,
                    reason: format!(
                        "Content-Range starts at {:?}, expected {}",
                        start, range.start
                    ),
                });
            }
            0
        }
        StatusCode::OK => range.start,
        other => {
            return Err(DownloadError::ChunkFetch {
                index: range.index,
                reason: format!("HTTP {}", other),
            });
        }
    };

    let mut body = response.bytes_stream();
    while !region.is_full() {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;

        let mut data = &chunk[..];
        if skip > 0 {
            let n = skip.min(data.len() as u64) as usize;
            data = &data[n..];
            skip -= n as u64;
        }
        if data.is_empty() {
            continue;
        }

        let stored = region.write(data)?;
        progress.add(stored as u64);
    }

    if !region.is_full() {
        return Err(DownloadError::ChunkFetch {
            index: range.index,
            reason: format!(
                "body ended after {} of {} bytes",
                region.written(),
                range.len
            ),
        });
    }
    Ok(())
}

/// Stream the whole resource into `dest`, restarting from scratch on a
/// transient failure. `on_progress` is called at most once per `interval`.
#[allow(clippy::too_many_arguments)]
pub async fn fetch_stream(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: &Progress,
    retry: &RetryPolicy,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(),
) -> Result<u64, DownloadError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        progress.set_downloaded(0);
        match stream_attempt(client, url, dest, progress, interval, cancel, &mut on_progress).await {
            Ok(written) => return Ok(written),
            Err(err) => {
                retry
                    .wait_before_retry("stream", attempt, err.for_chunk(0), cancel)
                    .await?
            }
        }
    }
}

async fn stream_attempt(
    client: &Client,
    url: &str,
    dest: &Path,
    progress: &Progress,
    interval: Duration,
    cancel: &CancellationToken,
    on_progress: &mut impl FnMut(),
) -> Result<u64, DownloadError> {
    let response = send(client.get(url), cancel).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::ChunkFetch {
            index: 0,
            reason: format!("HTTP {}", status),
        });
    }
    let expected = response.content_length();

    let mut out = tokio::fs::File::create(dest)
        .await
        .map_err(|source| DownloadError::FileCreate {
            path: dest.to_path_buf(),
            source,
        })?;

    let mut body = response.bytes_stream();
    let mut written = 0u64;
    let mut last_report = Instant::now();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            next = body.next() => next,
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;

        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
        progress.add(chunk.len() as u64);

        if last_report.elapsed() >= interval {
            on_progress();
            last_report = Instant::now();
        }
    }
    out.flush().await?;
    out.sync_all().await?;

    if let Some(expected) = expected {
        if written < expected {
            return Err(DownloadError::ChunkFetch {
                index: 0,
                reason: format!("body ended after {} of {} bytes", written, expected),
            });
        }
    }
    debug!(bytes = written, "Sequential stream complete");
    Ok(written)
}

/// Fetch one HLS segment, decrypt it when keyed, and store it at `dest`.
///
/// Decryption failures count as fetch failures and are retried the same way.
pub async fn fetch_segment(
    client: &Client,
    job: &SegmentJob,
    dest: &Path,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), DownloadError> {
    let what = format!("segment {}", job.index);
    let mut attempt = 0;
    let plain = loop {
        attempt += 1;
        match segment_attempt(client, job, cancel).await {
            Ok(plain) => break plain,
            Err(err) => {
                retry
                    .wait_before_retry(&what, attempt, err.for_chunk(job.index), cancel)
                    .await?
            }
        }
    };

    tokio::fs::write(dest, &plain).await?;
    trace!(index = job.index, bytes = plain.len(), "Segment stored");
    Ok(())
}

async fn segment_attempt(
    client: &Client,
    job: &SegmentJob,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, DownloadError> {
    let response = send(client.get(job.url.clone()), cancel).await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::ChunkFetch {
            index: job.index,
            reason: format!("HTTP {}", status),
        });
    }

    let body = tokio::select! {
        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
        body = response.bytes() => body?,
    };

    match &job.key {
        Some(key) => crypto::decrypt(job.index, &body, key),
        None => Ok(body.to_vec()),
    }
}
