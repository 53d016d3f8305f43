//! Rangeloader library
//!
//! Resumable, multi-range HTTP downloads with bounded parallelism, plus
//! ordered (optionally AES-128 encrypted) HLS segment lists.

pub mod downloader;
pub mod queue;
pub mod utils;

use std::path::PathBuf;

// Re-export main types for easier use
pub use downloader::{
    DownloadConfig, DownloadParam, DownloadTask, MediaSegment, ProgressSnapshot, RetryPolicy,
    SegmentKey, State,
};
pub use queue::{TaskEvent, TaskManager};
pub use utils::{DownloadError, Settings};

/// Create a task for `url` and register it with `config.task_manager`.
///
/// The task is returned in `None`; call `start()` or `suspend_start()` to run
/// it. An empty `save_name` is derived from the URL.
pub async fn download(
    url: &str,
    save_name: &str,
    save_path: impl Into<PathBuf>,
    config: DownloadConfig,
) -> Result<DownloadTask, DownloadError> {
    submit(DownloadParam::new(url, save_name, save_path), config).await
}

/// Like [`download`] for a prepared parameter set, e.g. an HLS segment list.
pub async fn submit(
    param: DownloadParam,
    config: DownloadConfig,
) -> Result<DownloadTask, DownloadError> {
    param.validate()?;
    let manager = config.task_manager.clone();
    Ok(manager.add(DownloadTask::new(param, config)).await)
}
