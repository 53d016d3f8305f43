#![allow(dead_code)]

pub mod range_server;

use rangeloader::utils::http::build_client;
use rangeloader::{DownloadConfig, RetryPolicy, TaskManager};
use std::time::Duration;

/// Deterministic, non-repeating-looking test payload.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn manager(max_concurrent: usize) -> TaskManager {
    let client = build_client("rangeloader-tests", Duration::from_secs(2)).unwrap();
    TaskManager::new(max_concurrent, client)
}

/// Small ranges and fast retries so tests finish quickly.
pub fn config(manager: &TaskManager, range_size: u64) -> DownloadConfig {
    DownloadConfig::new(manager.clone())
        .with_range_size(range_size)
        .with_range_concurrency(5)
        .with_probe_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        })
}
