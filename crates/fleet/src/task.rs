//! Task facility — long-running operations as observable objects.
//!
//! Every group operation runs on its own task. Clients long-poll the log
//! through `wait`: the call returns as soon as the task's index moves past
//! the one they have seen, or when the timeout elapses.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub progress: u32,
    pub message: String,
    pub index: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub status: TaskStatus,
    pub message: String,
    pub index: u64,
    pub progress: u32,
    pub logs: Vec<LogEntry>,
}

struct TaskInner {
    status: TaskStatus,
    message: String,
    progress: u32,
    index: u64,
    logs: Vec<LogEntry>,
}

pub struct Task {
    id: String,
    task_type: String,
    group_id: Option<String>,
    inner: Mutex<TaskInner>,
    index_tx: tokio::sync::watch::Sender<u64>,
}

impl Task {
    pub fn new(task_type: &str, group_id: Option<&str>) -> Arc<Task> {
        let (index_tx, _) = tokio::sync::watch::channel(0);
        Arc::new(Task {
            id: Uuid::new_v4().simple().to_string(),
            task_type: task_type.to_string(),
            group_id: group_id.map(|g| g.to_string()),
            inner: Mutex::new(TaskInner {
                status: TaskStatus::Running,
                message: String::new(),
                progress: 0,
                index: 0,
                logs: Vec::new(),
            }),
            index_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.lock().status
    }

    pub fn index(&self) -> u64 {
        self.inner.lock().index
    }

    pub fn log(&self, message: impl Into<String>) {
        self.log_with_progress(message, None);
    }

    pub fn log_with_progress(&self, message: impl Into<String>, progress: Option<u32>) {
        let message = message.into();
        info!(task = %self.id, "TASK: {message}");

        let index = {
            let mut inner = self.inner.lock();
            if let Some(progress) = progress {
                inner.progress = progress;
            }
            inner.index += 1;
            let entry = LogEntry {
                timestamp: Utc::now(),
                progress: inner.progress,
                message,
                index: inner.index,
            };
            inner.logs.push(entry);
            inner.index
        };
        let _ = self.index_tx.send(index);
    }

    pub fn set_status(&self, status: TaskStatus, message: Option<&str>) {
        let index = {
            let mut inner = self.inner.lock();
            inner.status = status;
            if let Some(message) = message {
                inner.message = message.to_string();
            }
            inner.index += 1;
            inner.index
        };
        let _ = self.index_tx.send(index);
    }

    /// Long-poll: return the current index as soon as it differs from
    /// `index`, or after `timeout`.
    pub async fn wait(&self, index: u64, timeout: Duration) -> u64 {
        let mut rx = self.index_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let current = self.index();
            if current != index {
                return current;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // Timeout, or the task was dropped mid-wait.
                _ => return self.index(),
            }
        }
    }

    pub async fn wait_for_completion(&self) -> TaskStatus {
        let mut seen = 0;
        loop {
            let status = self.status();
            if status != TaskStatus::Running {
                return status;
            }
            seen = self.wait(seen, Duration::from_secs(60)).await;
        }
    }

    /// A serializable snapshot; with `after` set only log entries past
    /// that index are included.
    pub fn view(&self, after: Option<u64>) -> TaskView {
        let inner = self.inner.lock();
        let logs = match after {
            Some(after) => inner
                .logs
                .iter()
                .filter(|l| l.index > after)
                .cloned()
                .collect(),
            None => inner.logs.clone(),
        };
        TaskView {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            group_id: self.group_id.clone(),
            status: inner.status,
            message: inner.message.clone(),
            index: inner.index,
            progress: inner.progress,
            logs,
        }
    }
}

/// Live tasks by id.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<String, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, task_type: &str, group_id: Option<&str>) -> Arc<Task> {
        let task = Task::new(task_type, group_id);
        self.tasks.insert(task.id().to_string(), task.clone());
        task
    }

    pub fn get(&self, id: &str) -> Option<Arc<Task>> {
        self.tasks.get(id).map(|t| t.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<Task>> {
        self.tasks.iter().map(|t| t.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_advances_index() {
        let task = Task::new("create_tarantool", Some("abc"));
        assert_eq!(task.index(), 0);
        task.log("Creating group");
        task.log("Allocating instance to physical nodes");
        assert_eq!(task.index(), 2);
        assert_eq!(task.view(None).logs.len(), 2);
    }

    #[test]
    fn test_view_filters_by_index() {
        let task = Task::new("update_tarantool", Some("abc"));
        task.log("one");
        task.log("two");
        task.log("three");
        let view = task.view(Some(2));
        assert_eq!(view.logs.len(), 1);
        assert_eq!(view.logs[0].message, "three");
    }

    #[tokio::test]
    async fn test_wait_returns_on_new_index() {
        let task = Task::new("create_tarantool", None);
        let waiter = task.clone();
        let handle =
            tokio::spawn(async move { waiter.wait(0, Duration::from_secs(5)).await });

        tokio::task::yield_now().await;
        task.log("progress");

        let index = handle.await.unwrap();
        assert_eq!(index, 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_changes() {
        let task = Task::new("create_tarantool", None);
        let index = task.wait(0, Duration::from_millis(20)).await;
        assert_eq!(index, 0);
    }

    #[tokio::test]
    async fn test_wait_for_completion() {
        let task = Task::new("delete_tarantool", None);
        let worker = task.clone();
        tokio::spawn(async move {
            worker.log("Removing containers");
            worker.set_status(TaskStatus::Success, None);
        });

        let status = task.wait_for_completion().await;
        assert_eq!(status, TaskStatus::Success);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TaskRegistry::new();
        let task = registry.create("backup_tarantool", Some("abc"));
        assert!(registry.get(task.id()).is_some());
        assert!(registry.get("missing").is_none());
    }
}
