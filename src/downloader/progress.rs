//! Progress tracking and task state for downloads

use crate::utils::format::{format_size, percent_str, ratio_percent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

/// What `download_size` / `total_size` count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProgressUnit {
    #[default]
    Bytes,
    Segments,
}

/// Live progress of one task, shared by all of its chunk workers.
///
/// `total` is -1 while the length is unknown. Increments are atomic and
/// clamp at `total` whenever it is known.
#[derive(Debug)]
pub struct Progress {
    downloaded: AtomicU64,
    total: AtomicI64,
    chunked: AtomicBool,
    segments: AtomicBool,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        Self {
            downloaded: AtomicU64::new(0),
            total: AtomicI64::new(-1),
            chunked: AtomicBool::new(false),
            segments: AtomicBool::new(false),
        }
    }

    /// Start a new accounting period.
    pub fn reset(&self, total: i64, chunked: bool, unit: ProgressUnit) {
        self.total.store(total.max(-1), Ordering::SeqCst);
        self.chunked.store(chunked, Ordering::SeqCst);
        self.segments
            .store(unit == ProgressUnit::Segments, Ordering::SeqCst);
        self.downloaded.store(0, Ordering::SeqCst);
    }

    pub fn set_downloaded(&self, value: u64) {
        self.downloaded.store(self.clamp(value), Ordering::SeqCst);
    }

    /// Credit `n` units and return the new total.
    pub fn add(&self, n: u64) -> u64 {
        let total = self.total.load(Ordering::SeqCst);
        let prev = self
            .downloaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                let next = cur.saturating_add(n);
                Some(if total >= 0 { next.min(total as u64) } else { next })
            })
            .unwrap_or_else(|cur| cur);
        let next = prev.saturating_add(n);
        if total >= 0 {
            next.min(total as u64)
        } else {
            next
        }
    }

    /// Take back `n` units credited by an attempt that later failed.
    pub fn sub(&self, n: u64) {
        let _ = self
            .downloaded
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| {
                Some(cur.saturating_sub(n))
            });
    }

    fn clamp(&self, value: u64) -> u64 {
        let total = self.total.load(Ordering::SeqCst);
        if total >= 0 {
            value.min(total as u64)
        } else {
            value
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> i64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked.load(Ordering::SeqCst)
    }

    pub fn percent(&self) -> f64 {
        self.snapshot().percent()
    }

    pub fn percent_str(&self) -> String {
        self.snapshot().percent_str()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            download_size: self.downloaded(),
            total_size: self.total(),
            is_chunked: self.is_chunked(),
            unit: if self.segments.load(Ordering::SeqCst) {
                ProgressUnit::Segments
            } else {
                ProgressUnit::Bytes
            },
        }
    }
}

/// Point-in-time copy of a [`Progress`], cheap to send to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub download_size: u64,
    pub total_size: i64,
    pub is_chunked: bool,
    pub unit: ProgressUnit,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            download_size: 0,
            total_size: -1,
            is_chunked: false,
            unit: ProgressUnit::Bytes,
        }
    }
}

impl ProgressSnapshot {
    /// Percentage in `[0, 100]`; always 0 when the length is not usable.
    pub fn percent(&self) -> f64 {
        if self.is_chunked {
            return 0.0;
        }
        ratio_percent(self.download_size as i64, self.total_size)
    }

    pub fn percent_str(&self) -> String {
        if self.is_chunked {
            return percent_str(0, 0);
        }
        percent_str(self.download_size as i64, self.total_size)
    }

    pub fn downloaded_str(&self) -> String {
        match self.unit {
            ProgressUnit::Bytes => format_size(self.download_size as i64),
            ProgressUnit::Segments => self.download_size.to_string(),
        }
    }

    pub fn total_str(&self) -> String {
        match self.unit {
            ProgressUnit::Bytes => format_size(self.total_size),
            ProgressUnit::Segments if self.total_size >= 0 => self.total_size.to_string(),
            ProgressUnit::Segments => "--".to_string(),
        }
    }
}

/// Lifecycle state of a download task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum State {
    /// Constructed, never started.
    #[default]
    None,
    /// Submitted, waiting for a slot in the task manager.
    Waiting,
    Downloading,
    Stopped,
    Failed(String),
    Succeed,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::None => "None",
            State::Waiting => "Waiting",
            State::Downloading => "Downloading",
            State::Stopped => "Stopped",
            State::Failed(_) => "Failed",
            State::Succeed => "Succeed",
        }
    }

    /// States that end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Stopped | State::Failed(_) | State::Succeed)
    }

    /// States from which `start()` submits a new run.
    pub fn is_startable(&self) -> bool {
        self.can_transition_to(&State::Waiting)
    }

    /// The only legal edges of the task state machine.
    pub fn can_transition_to(&self, next: &State) -> bool {
        matches!(
            (self, next),
            (State::None | State::Stopped | State::Failed(_), State::Waiting)
                | (State::Waiting, State::Downloading)
                | (State::Waiting, State::Stopped)
                | (
                    State::Downloading,
                    State::Succeed | State::Stopped | State::Failed(_)
                )
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Failed(reason) => write!(f, "Failed({})", reason),
            other => f.write_str(other.name()),
        }
    }
}
