//! Download task: parameters, state machine and control surface

use crate::downloader::engine::{DownloadConfig, DownloadEngine};
use crate::downloader::layout;
use crate::downloader::progress::{Progress, ProgressSnapshot, ProgressUnit, State};
use crate::downloader::segment::MediaSegment;
use crate::queue::{TaskEvent, TaskManager};
use crate::utils::error::DownloadError;
use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;
const FALLBACK_NAME: &str = "download";

/// What to fetch and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadParam {
    pub url: String,
    /// File name inside `save_path`; empty means derive it from the URL.
    pub save_name: String,
    pub save_path: PathBuf,
    /// Ordered HLS segments. `url` is then the manifest URL.
    pub segments: Option<Vec<MediaSegment>>,
}

impl DownloadParam {
    pub fn new(
        url: impl Into<String>,
        save_name: impl Into<String>,
        save_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            url: url.into(),
            save_name: save_name.into(),
            save_path: save_path.into(),
            segments: None,
        }
    }

    /// Switch to HLS mode.
    pub fn with_segments(mut self, segments: Vec<MediaSegment>) -> Self {
        self.segments = Some(segments);
        self
    }

    pub fn is_hls(&self) -> bool {
        self.segments.is_some()
    }

    /// Effective file name.
    pub fn file_name(&self) -> String {
        let name = self.save_name.trim();
        if name.is_empty() {
            default_save_name(&self.url, self.is_hls())
        } else {
            name.to_string()
        }
    }

    /// Final path `F`.
    pub fn target(&self) -> PathBuf {
        self.save_path.join(self.file_name())
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        let url = Url::parse(&self.url)
            .map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", self.url, e)))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(DownloadError::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                other, self.url
            ))),
        }
    }
}

/// File name derived from the last non-empty path segment of `url`.
///
/// In HLS mode a `.m3u8` playlist name becomes `.ts`.
pub fn default_save_name(url: &str, hls: bool) -> String {
    let last = Url::parse(url).ok().and_then(|u| {
        u.path_segments()?
            .filter(|s| !s.is_empty())
            .last()
            .map(decode_segment)
    });

    let name = match last {
        Some(name) if !name.trim().is_empty() && name != "." && name != ".." => name,
        _ => FALLBACK_NAME.to_string(),
    };

    if hls {
        if let Some(stem) = name.strip_suffix(".m3u8") {
            if !stem.is_empty() {
                return format!("{}.ts", stem);
            }
        }
    }
    name
}

fn decode_segment(segment: &str) -> String {
    percent_decode_str(segment)
        .decode_utf8_lossy()
        .replace(|c: char| c == '/' || c == '\\', "_")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct TaskInner {
    id: String,
    param: DownloadParam,
    config: DownloadConfig,
    state: watch::Sender<State>,
    progress: Arc<Progress>,
    events: broadcast::Sender<TaskEvent>,
    cancel: Mutex<CancellationToken>,
    last_error: Mutex<Option<Arc<DownloadError>>>,
    created_at: DateTime<Utc>,
}

/// Handle to one download. Clones share the same task.
#[derive(Clone)]
pub struct DownloadTask {
    inner: Arc<TaskInner>,
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.inner.id)
            .field("url", &self.inner.param.url)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl DownloadTask {
    pub fn new(param: DownloadParam, config: DownloadConfig) -> Self {
        let (state, _) = watch::channel(State::None);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(TaskInner {
                id: Uuid::new_v4().to_string(),
                param,
                config,
                state,
                progress: Arc::new(Progress::new()),
                events,
                cancel: Mutex::new(CancellationToken::new()),
                last_error: Mutex::new(None),
                created_at: Utc::now(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn param(&self) -> &DownloadParam {
        &self.inner.param
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    fn manager(&self) -> &TaskManager {
        &self.inner.config.task_manager
    }

    pub fn state(&self) -> State {
        self.inner.state.borrow().clone()
    }

    pub fn is_succeed(&self) -> bool {
        *self.inner.state.borrow() == State::Succeed
    }

    pub fn progress(&self) -> ProgressSnapshot {
        self.inner.progress.snapshot()
    }

    pub fn snapshot(&self) -> (State, ProgressSnapshot) {
        (self.state(), self.progress())
    }

    /// Event stream: one item per state change and per completed chunk.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<State> {
        self.inner.state.subscribe()
    }

    /// Error that ended the most recent failed run.
    pub fn last_error(&self) -> Option<Arc<DownloadError>> {
        lock(&self.inner.last_error).clone()
    }

    /// Apply `next` if the state machine allows it. Every state write goes
    /// through here.
    pub(crate) fn transition(&self, next: State) -> Result<(), DownloadError> {
        let mut from = None;
        self.inner.state.send_if_modified(|current| {
            if current.can_transition_to(&next) {
                from = Some(std::mem::replace(current, next.clone()));
                true
            } else {
                false
            }
        });

        match from {
            Some(from) => {
                info!(task_id = %self.inner.id, from = from.name(), to = next.name(), "State changed");
                let _ = self
                    .inner
                    .events
                    .send(TaskEvent::state_changed(&self.inner.id, next));
                Ok(())
            }
            None => Err(DownloadError::InvalidTransition {
                from: self.state().name().to_string(),
                to: next.name().to_string(),
            }),
        }
    }

    /// Submit the task to its manager. Only `None`, `Stopped` and `Failed`
    /// tasks move to `Waiting`; other states are left alone.
    pub async fn start(&self) {
        if let Err(e) = self.transition(State::Waiting) {
            debug!(task_id = %self.inner.id, "start ignored: {}", e);
            return;
        }
        *lock(&self.inner.cancel) = CancellationToken::new();
        self.manager().submit(self.clone()).await;
    }

    /// Stop a waiting or running task. Files on disk are kept for resume.
    pub async fn stop(&self) {
        match self.state() {
            State::Waiting => {
                if !self.manager().stop_waiting(self).await && self.state() == State::Downloading {
                    // promoted before we got the queue lock
                    lock(&self.inner.cancel).cancel();
                }
            }
            State::Downloading => {
                debug!(task_id = %self.inner.id, "Cancelling run");
                lock(&self.inner.cancel).cancel();
            }
            other => debug!(task_id = %self.inner.id, "stop ignored in state {}", other),
        }
    }

    /// Start and wait until the run ends. Returns the terminal state.
    ///
    /// A task already in flight is simply awaited.
    pub async fn suspend_start(&self) -> State {
        let mut rx = self.watch_state();
        self.start().await;
        let result = rx.wait_for(|state| state.is_terminal()).await;
        match result {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Discard every artifact of this task, including a finished file.
    /// Refused while the task is waiting or downloading.
    pub async fn clear(&self) -> Result<(), DownloadError> {
        let state = self.state();
        if matches!(state, State::Waiting | State::Downloading) {
            return Err(DownloadError::InvalidTransition {
                from: state.name().to_string(),
                to: "Cleared".to_string(),
            });
        }
        layout::clear(&self.inner.param.target()).await?;
        self.inner.progress.reset(-1, false, ProgressUnit::Bytes);
        info!(task_id = %self.inner.id, "Cleared artifacts");
        Ok(())
    }

    /// One run, spawned by the manager after the `Downloading` transition.
    pub(crate) async fn run(self) {
        let cancel = lock(&self.inner.cancel).clone();
        let engine = DownloadEngine::new(
            self.manager().client().clone(),
            self.inner.config.clone(),
            self.inner.id.clone(),
            Arc::clone(&self.inner.progress),
            self.inner.events.clone(),
        );

        let result = engine.run(&self.inner.param, &cancel).await;
        let next = match result {
            Ok(()) => State::Succeed,
            Err(DownloadError::Cancelled) => State::Stopped,
            Err(e) => {
                error!(task_id = %self.inner.id, "Download failed: {}", e);
                let message = e.to_string();
                *lock(&self.inner.last_error) = Some(Arc::new(e));
                State::Failed(message)
            }
        };

        self.manager().finished(&self, next).await;
    }
}
