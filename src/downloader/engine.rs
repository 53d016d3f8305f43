//! Download engine: probe, plan, fetch in parallel, finalize

use crate::downloader::crypto::SegmentKey;
use crate::downloader::layout::{self, RegionFile};
use crate::downloader::progress::{Progress, ProgressUnit};
use crate::downloader::resume::{PlanLayout, ResumeState};
use crate::downloader::retry::RetryPolicy;
use crate::downloader::segment::{self, ByteRange, MediaSegment, SegmentJob};
use crate::downloader::task::DownloadParam;
use crate::downloader::{executor, fetcher, merger, probe};
use crate::queue::{TaskEvent, TaskManager};
use crate::utils::error::DownloadError;
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-task download configuration
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub range_size: u64,               // Bytes per range request (default: 5 MiB)
    pub range_concurrency: usize,      // Simultaneous range/segment fetches (default: 5)
    pub retry: RetryPolicy,            // Local retry budget per chunk
    pub key: Option<SegmentKey>,       // Manifest-wide HLS key
    pub probe_timeout: Duration,       // Limit on the range probe
    pub progress_interval: Duration,   // Throttle for sequential progress events
    pub task_manager: TaskManager,     // Admission and shared HTTP client
}

impl DownloadConfig {
    pub const DEFAULT_RANGE_SIZE: u64 = 5 * 1024 * 1024;
    pub const DEFAULT_RANGE_CONCURRENCY: usize = 5;

    pub fn new(task_manager: TaskManager) -> Self {
        Self {
            range_size: Self::DEFAULT_RANGE_SIZE,
            range_concurrency: Self::DEFAULT_RANGE_CONCURRENCY,
            retry: RetryPolicy::default(),
            key: None,
            probe_timeout: Duration::from_secs(15),
            progress_interval: Duration::from_millis(250),
            task_manager,
        }
    }

    pub fn with_range_size(mut self, range_size: u64) -> Self {
        self.range_size = range_size.max(1);
        self
    }

    pub fn with_range_concurrency(mut self, range_concurrency: usize) -> Self {
        self.range_concurrency = range_concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_key(mut self, key: SegmentKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

/// Executes one run of one task.
///
/// The engine owns no state between runs; everything needed to resume lives
/// on disk next to the target file.
pub struct DownloadEngine {
    client: Client,
    config: DownloadConfig,
    task_id: String,
    progress: Arc<Progress>,
    events: broadcast::Sender<TaskEvent>,
}

impl DownloadEngine {
    pub fn new(
        client: Client,
        config: DownloadConfig,
        task_id: String,
        progress: Arc<Progress>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            client,
            config,
            task_id,
            progress,
            events,
        }
    }

    /// Download `param` to its target. Returns `Cancelled` when `cancel`
    /// fires; partial files are kept in that case.
    pub async fn run(
        &self,
        param: &DownloadParam,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let target = param.target();
        tokio::fs::create_dir_all(&param.save_path)
            .await
            .map_err(|source| DownloadError::FileCreate {
                path: param.save_path.clone(),
                source,
            })?;

        if let Some(segments) = &param.segments {
            return self.run_segments(&param.url, &target, segments, cancel).await;
        }

        let probed = probe::probe(
            &self.client,
            &param.url,
            self.config.probe_timeout,
            cancel,
        )
        .await;

        match probed {
            Ok(result) if result.can_split() => {
                let total = result.total_length.unwrap_or_default();
                self.run_ranged(&param.url, &target, total, cancel).await
            }
            Ok(result) => {
                debug!(task_id = %self.task_id, "Ranges unavailable, streaming sequentially");
                self.run_sequential(&param.url, &target, result.total_length, cancel)
                    .await
            }
            Err(DownloadError::Cancelled) => Err(DownloadError::Cancelled),
            Err(e) => {
                warn!(task_id = %self.task_id, "{}; falling back to a sequential download", e);
                self.run_sequential(&param.url, &target, None, cancel).await
            }
        }
    }

    fn publish_progress(&self) {
        // no subscribers is fine
        let _ = self
            .events
            .send(TaskEvent::progress(&self.task_id, self.progress.snapshot()));
    }

    async fn record_done(
        &self,
        markers: &Mutex<ResumeState>,
        shadow: &Path,
        index: usize,
    ) -> Result<usize, DownloadError> {
        let mut state = markers.lock().await;
        state.mark_done(index);
        state.save(shadow).await?;
        drop(state);
        self.publish_progress();
        Ok(index)
    }

    async fn run_sequential(
        &self,
        url: &str,
        target: &Path,
        total: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let shadow = layout::shadow(target);
        let tmp = layout::tmp(target);

        ResumeState::new(url, PlanLayout::Stream).save(&shadow).await?;
        let total = total.map(|t| t as i64).unwrap_or(-1);
        self.progress.reset(total, true, ProgressUnit::Bytes);
        self.publish_progress();

        let written = fetcher::fetch_stream(
            &self.client,
            url,
            &tmp,
            &self.progress,
            &self.config.retry,
            self.config.progress_interval,
            cancel,
            || self.publish_progress(),
        )
        .await?;
        self.publish_progress();

        info!(task_id = %self.task_id, bytes = written, "Stream finished");
        self.finalize(&tmp, target).await
    }

    async fn run_ranged(
        &self,
        url: &str,
        target: &Path,
        total: u64,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let shadow = layout::shadow(target);
        let tmp = layout::tmp(target);
        let plan = PlanLayout::Ranges {
            total,
            range_size: self.config.range_size,
        };

        let tmp_len = tokio::fs::metadata(&tmp).await.ok().map(|m| m.len());
        let state = match ResumeState::load(&shadow).await {
            Some(state) if state.matches(url, &plan) && tmp_len == Some(total) => {
                info!(
                    task_id = %self.task_id,
                    completed = state.completed.len(),
                    "Resuming from {}",
                    tmp.display()
                );
                state
            }
            _ => {
                layout::recreate(&tmp, total).await?;
                ResumeState::new(url, plan)
            }
        };
        state.save(&shadow).await?;

        let ranges = segment::plan_ranges(total, self.config.range_size);
        let (done, pending): (Vec<ByteRange>, Vec<ByteRange>) =
            ranges.iter().copied().partition(|r| state.is_done(r.index));
        self.progress.reset(total as i64, false, ProgressUnit::Bytes);
        self.progress
            .set_downloaded(done.iter().map(|r| r.len).sum());
        self.publish_progress();

        info!(
            task_id = %self.task_id,
            url = url,
            ranges = ranges.len(),
            pending = pending.len(),
            "Fetching ranges"
        );

        let region_file = RegionFile::open(&tmp)?;
        let markers = Mutex::new(state);
        let scope = cancel.child_token();
        let expected = pending.len();

        let (file, markers_ref, scope_ref, shadow_ref) = (&region_file, &markers, &scope, &shadow);
        let results = executor::run(
            pending,
            self.config.range_concurrency,
            &scope,
            move |range| async move {
                let outcome = match fetcher::fetch_range(
                    &self.client,
                    url,
                    range,
                    file,
                    &self.progress,
                    &self.config.retry,
                    scope_ref,
                )
                .await
                {
                    Ok(()) => self.record_done(markers_ref, shadow_ref, range.index).await,
                    Err(e) => Err(e),
                };
                abort_siblings_on_failure(&outcome, scope_ref);
                outcome
            },
        )
        .await;

        settle(results, expected, cancel)?;

        region_file.sync()?;
        let open_handles = region_file.handle_count();
        if open_handles > 1 {
            warn!(task_id = %self.task_id, open_handles, "Regions still open at finalize");
        }
        drop(region_file);

        self.finalize(&tmp, target).await
    }

    async fn run_segments(
        &self,
        url: &str,
        target: &Path,
        segments: &[MediaSegment],
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        let jobs = segment::plan_segments(url, segments, self.config.key.as_ref())?;
        let shadow = layout::shadow(target);
        let plan = PlanLayout::Segments { count: jobs.len() };

        let mut state = match ResumeState::load(&shadow).await {
            Some(state) if state.matches(url, &plan) => state,
            _ => {
                layout::clear_artifacts(target).await?;
                ResumeState::new(url, plan)
            }
        };
        // a marker without its file is refetched
        state
            .completed
            .retain(|&index| layout::ts_file(target, index).exists());
        state.save(&shadow).await?;

        let pending: Vec<SegmentJob> = jobs
            .iter()
            .filter(|job| !state.is_done(job.index))
            .cloned()
            .collect();
        self.progress
            .reset(jobs.len() as i64, false, ProgressUnit::Segments);
        self.progress.set_downloaded(state.completed.len() as u64);
        self.publish_progress();

        info!(
            task_id = %self.task_id,
            url = url,
            segments = jobs.len(),
            pending = pending.len(),
            "Fetching HLS segments"
        );

        let markers = Mutex::new(state);
        let scope = cancel.child_token();
        let expected = pending.len();

        let (markers_ref, scope_ref, shadow_ref) = (&markers, &scope, &shadow);
        let results = executor::run(
            pending,
            self.config.range_concurrency,
            &scope,
            move |job| async move {
                let dest = layout::ts_file(target, job.index);
                let outcome = match fetcher::fetch_segment(
                    &self.client,
                    &job,
                    &dest,
                    &self.config.retry,
                    scope_ref,
                )
                .await
                {
                    Ok(()) => {
                        self.progress.add(1);
                        self.record_done(markers_ref, shadow_ref, job.index).await
                    }
                    Err(e) => Err(e),
                };
                abort_siblings_on_failure(&outcome, scope_ref);
                outcome
            },
        )
        .await;

        settle(results, expected, cancel)?;

        merger::merge_segments(target, jobs.len()).await?;
        layout::clear_artifacts(target).await?;
        info!(task_id = %self.task_id, "Saved {}", target.display());
        Ok(())
    }

    /// Move the working file into place and drop the artifacts.
    async fn finalize(&self, tmp: &Path, target: &Path) -> Result<(), DownloadError> {
        tokio::fs::rename(tmp, target)
            .await
            .map_err(|source| DownloadError::Finalize {
                path: target.to_path_buf(),
                source,
            })?;
        layout::clear_artifacts(target).await?;
        info!(task_id = %self.task_id, "Saved {}", target.display());
        Ok(())
    }
}

/// A chunk that gave up takes its siblings down with it.
fn abort_siblings_on_failure<T>(outcome: &Result<T, DownloadError>, scope: &CancellationToken) {
    if let Err(e) = outcome {
        if !matches!(e, DownloadError::Cancelled) {
            scope.cancel();
        }
    }
}

/// Reduce per-chunk results to the run outcome. A stop request wins over
/// chunk errors; otherwise the first real error is reported.
fn settle<T>(
    results: Vec<Result<T, DownloadError>>,
    expected: usize,
    cancel: &CancellationToken,
) -> Result<Vec<T>, DownloadError> {
    if cancel.is_cancelled() {
        return Err(DownloadError::Cancelled);
    }

    let mut completed = Vec::with_capacity(results.len());
    let mut interrupted = false;
    for result in results {
        match result {
            Ok(value) => completed.push(value),
            Err(DownloadError::Cancelled) => interrupted = true,
            Err(e) => return Err(e),
        }
    }

    if interrupted || completed.len() < expected {
        return Err(DownloadError::Cancelled);
    }
    Ok(completed)
}
