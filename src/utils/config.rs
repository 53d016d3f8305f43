//! Application configuration

use crate::downloader::engine::DownloadConfig;
use crate::downloader::retry::RetryPolicy;
use crate::queue::TaskManager;
use crate::utils::error::DownloadError;
use crate::utils::http::{build_client, DEFAULT_USER_AGENT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Application settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Download location
    pub download_location: PathBuf,

    /// Bytes per range request
    pub range_size: u64,

    /// Simultaneous range or segment fetches per task
    pub range_concurrency: usize,

    /// Maximum concurrent downloads
    pub max_concurrent_tasks: usize,

    /// Attempts per chunk, including the first
    pub retry_attempts: u32,

    /// Delay before the first retry, doubled afterwards
    pub retry_delay_ms: u64,

    pub probe_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_location: dirs::download_dir().unwrap_or_else(|| PathBuf::from("./downloads")),
            range_size: DownloadConfig::DEFAULT_RANGE_SIZE,
            range_concurrency: DownloadConfig::DEFAULT_RANGE_CONCURRENCY,
            max_concurrent_tasks: 3,
            retry_attempts: 3,
            retry_delay_ms: 500,
            probe_timeout_secs: 15,
            connect_timeout_secs: 15,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl Settings {
    /// Read settings from a JSON file. Missing keys take their defaults.
    pub async fn load(path: &Path) -> Result<Self, DownloadError> {
        let raw = tokio::fs::read(path).await?;
        let settings: Settings = serde_json::from_slice(&raw)?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings.sanitized())
    }

    /// Enforce sane minimums
    pub fn sanitized(mut self) -> Self {
        self.range_size = self.range_size.max(1);
        self.range_concurrency = self.range_concurrency.max(1);
        self.max_concurrent_tasks = self.max_concurrent_tasks.max(1);
        self.retry_attempts = self.retry_attempts.max(1);
        self.probe_timeout_secs = self.probe_timeout_secs.max(1);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        if self.user_agent.trim().is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_string();
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            ..RetryPolicy::default()
        }
    }

    /// Build the process-wide manager together with its shared HTTP client.
    pub fn build_manager(&self) -> Result<TaskManager, DownloadError> {
        let client = build_client(
            &self.user_agent,
            Duration::from_secs(self.connect_timeout_secs),
        )?;
        Ok(TaskManager::new(self.max_concurrent_tasks, client))
    }

    /// Per-task configuration bound to `manager`.
    pub fn download_config(&self, manager: &TaskManager) -> DownloadConfig {
        DownloadConfig::new(manager.clone())
            .with_range_size(self.range_size)
            .with_range_concurrency(self.range_concurrency)
            .with_retry(self.retry_policy())
            .with_probe_timeout(Duration::from_secs(self.probe_timeout_secs))
    }
}
