//! Task events broadcast to subscribers

use crate::downloader::progress::{ProgressSnapshot, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Updates published by a download task to its subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    /// The task moved to a new state
    StateChanged {
        task_id: String,
        state: State,
        timestamp: DateTime<Utc>,
    },
    /// Bytes or segments were completed
    Progress {
        task_id: String,
        progress: ProgressSnapshot,
        timestamp: DateTime<Utc>,
    },
}

impl TaskEvent {
    pub fn state_changed(task_id: &str, state: State) -> Self {
        TaskEvent::StateChanged {
            task_id: task_id.to_string(),
            state,
            timestamp: Utc::now(),
        }
    }

    pub fn progress(task_id: &str, progress: ProgressSnapshot) -> Self {
        TaskEvent::Progress {
            task_id: task_id.to_string(),
            progress,
            timestamp: Utc::now(),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::StateChanged { task_id, .. } | TaskEvent::Progress { task_id, .. } => task_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TaskEvent::StateChanged { timestamp, .. } | TaskEvent::Progress { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = TaskEvent::state_changed("abc", State::Failed("HTTP 404".to_string()));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("StateChanged"));
        assert!(json.contains("HTTP 404"));

        let back: TaskEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id(), "abc");
        match back {
            TaskEvent::StateChanged { state, .. } => {
                assert_eq!(state, State::Failed("HTTP 404".to_string()))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_progress_event_carries_snapshot() {
        let snapshot = ProgressSnapshot {
            download_size: 10,
            total_size: 40,
            ..Default::default()
        };
        let event = TaskEvent::progress("t1", snapshot);
        assert!(event.timestamp() <= Utc::now());
        if let TaskEvent::Progress { progress, .. } = event {
            assert_eq!(progress.percent(), 25.0);
        } else {
            panic!("expected progress event");
        }
    }
}
