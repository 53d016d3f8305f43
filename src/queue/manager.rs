//! Process-wide admission control for download tasks

use crate::downloader::progress::State;
use crate::downloader::task::DownloadTask;
use reqwest::Client;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Caps the number of concurrently running tasks and queues the rest (FIFO).
///
/// Clones share the same queue. The manager only tracks admission; each
/// task's own state machine stays authoritative.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    max_concurrent: usize,
    client: Client,
    queue: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<DownloadTask>,
    active: HashMap<String, JoinHandle<()>>,
    registered: Vec<DownloadTask>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("max_concurrent", &self.inner.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    /// Create a manager; `client` is shared by every task it admits.
    pub fn new(max_concurrent: usize, client: Client) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                max_concurrent: max_concurrent.max(1),
                client,
                queue: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Register `task` with this manager and hand it back.
    ///
    /// Admission happens on `task.start()`.
    pub async fn add(&self, task: DownloadTask) -> DownloadTask {
        let mut queue = self.inner.queue.lock().await;
        if !queue.registered.iter().any(|t| t.id() == task.id()) {
            queue.registered.push(task.clone());
            debug!(task_id = task.id(), "Registered task");
        }
        task
    }

    /// Queue a `Waiting` task and promote as many as the limit allows.
    pub(crate) async fn submit(&self, task: DownloadTask) {
        let mut queue = self.inner.queue.lock().await;
        if !queue.registered.iter().any(|t| t.id() == task.id()) {
            queue.registered.push(task.clone());
        }
        queue.waiting.push_back(task);
        self.promote(&mut queue);
    }

    /// Called by a task when its run ends. The terminal state is applied
    /// under the queue lock, so a restart cannot be admitted while the old
    /// run still holds its slot.
    pub(crate) async fn finished(&self, task: &DownloadTask, outcome: State) {
        let mut queue = self.inner.queue.lock().await;
        if let Err(e) = task.transition(outcome) {
            error!(task_id = task.id(), "{}", e);
        }
        queue.active.remove(task.id());
        self.promote(&mut queue);
    }

    /// Remove a queued task and mark it `Stopped`. Returns false when the
    /// task is not waiting any more (it may have just been promoted).
    pub(crate) async fn stop_waiting(&self, task: &DownloadTask) -> bool {
        let mut queue = self.inner.queue.lock().await;
        queue.waiting.retain(|t| t.id() != task.id());
        task.state() == State::Waiting && task.transition(State::Stopped).is_ok()
    }

    // Runs under the queue lock, so promotion and `stop_waiting` never race.
    fn promote(&self, queue: &mut QueueState) {
        while queue.active.len() < self.inner.max_concurrent {
            let Some(task) = queue.waiting.pop_front() else {
                break;
            };
            if task.transition(State::Downloading).is_err() {
                // stopped while queued
                continue;
            }
            info!(
                task_id = task.id(),
                active = queue.active.len() + 1,
                "Admitted task"
            );
            let id = task.id().to_string();
            let handle = tokio::spawn(task.run());
            queue.active.insert(id, handle);
        }
    }

    /// Every task registered with this manager.
    pub async fn tasks(&self) -> Vec<DownloadTask> {
        self.inner.queue.lock().await.registered.clone()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.queue.lock().await.active.len()
    }

    pub async fn waiting_count(&self) -> usize {
        self.inner.queue.lock().await.waiting.len()
    }

    /// Forget a task that is not running. Running tasks are left alone.
    ///
    /// A queued task is dequeued and moved to `Stopped`, so it can be
    /// started again later.
    pub async fn remove(&self, task_id: &str) -> Option<DownloadTask> {
        let mut queue = self.inner.queue.lock().await;
        if queue.active.contains_key(task_id) {
            return None;
        }
        if let Some(pos) = queue.waiting.iter().position(|t| t.id() == task_id) {
            if let Some(task) = queue.waiting.remove(pos) {
                if let Err(e) = task.transition(State::Stopped) {
                    debug!(task_id, "dequeued task kept its state: {}", e);
                }
            }
        }
        let index = queue.registered.iter().position(|t| t.id() == task_id)?;
        Some(queue.registered.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::engine::DownloadConfig;
    use crate::downloader::task::DownloadParam;
    use crate::utils::http::build_client;
    use std::time::Duration;

    fn manager(max: usize) -> TaskManager {
        let client = build_client("test-agent", Duration::from_secs(1)).unwrap();
        TaskManager::new(max, client)
    }

    #[tokio::test]
    async fn test_new_manager_is_empty() {
        let manager = manager(0);
        assert_eq!(manager.max_concurrent(), 1, "zero clamps to one");
        assert_eq!(manager.active_count().await, 0);
        assert_eq!(manager.waiting_count().await, 0);
        assert!(manager.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_registers_once() {
        let manager = manager(2);
        let config = DownloadConfig::new(manager.clone());
        let task = DownloadTask::new(DownloadParam::new("http://127.0.0.1:9/a", "a", "/tmp"), config);

        let returned = manager.add(task.clone()).await;
        manager.add(task.clone()).await;

        assert_eq!(returned.id(), task.id());
        assert_eq!(manager.tasks().await.len(), 1);
        assert_eq!(task.state(), State::None, "add does not start the task");
    }

    #[tokio::test]
    async fn test_remove_unregisters() {
        let manager = manager(2);
        let config = DownloadConfig::new(manager.clone());
        let task = manager
            .add(DownloadTask::new(DownloadParam::new("http://127.0.0.1:9/a", "a", "/tmp"), config))
            .await;

        assert!(manager.remove(task.id()).await.is_some());
        assert!(manager.remove(task.id()).await.is_none());
        assert!(manager.tasks().await.is_empty());
    }
}
