use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};
use vmfleet_id::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Progress,
    Success,
    Error,
}

impl TaskStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Progress => "progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally visible task state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_secs: u64,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task registry is full ({capacity} tasks in flight)")]
    CapacityExceeded { capacity: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskLookupError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task expired: {0}")]
    Expired(TaskId),
}

#[derive(Debug, Clone)]
pub struct TaskRegistryConfig {
    /// Maximum retained tasks, finished or not.
    pub capacity: usize,
    /// How long a finished task stays queryable.
    pub ttl: Duration,
    /// Default wall-clock limit for a workflow.
    pub default_timeout: Duration,
}

impl Default for TaskRegistryConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl: Duration::from_secs(3600),
            default_timeout: Duration::from_secs(1800),
        }
    }
}

struct Entry {
    task: Task,
    cancel: watch::Sender<bool>,
    finished_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Entry>,
    tombstones: HashSet<TaskId>,
    tombstone_order: VecDeque<TaskId>,
}

impl Inner {
    fn bury(&mut self, id: TaskId, limit: usize) {
        if self.tombstones.insert(id) {
            self.tombstone_order.push_back(id);
        }
        while self.tombstone_order.len() > limit {
            if let Some(old) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&old);
            }
        }
    }
}

/// Bounded, TTL-expiring task map.
///
/// Unknown ids and expired ids are distinguished through a bounded set of
/// tombstones, so callers never see a fabricated task.
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    config: TaskRegistryConfig,
}

impl TaskRegistry {
    pub fn new(config: TaskRegistryConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            config,
        }
    }

    pub fn config(&self) -> &TaskRegistryConfig {
        &self.config
    }

    fn tombstone_limit(&self) -> usize {
        self.config.capacity.saturating_mul(4).max(64)
    }

    fn is_expired(&self, entry: &Entry, now: Instant) -> bool {
        entry
            .finished_at
            .is_some_and(|at| now.duration_since(at) >= self.config.ttl)
    }

    /// Register a task with the default timeout.
    pub async fn create(
        &self,
        status: TaskStatus,
        task_type: &str,
        message: &str,
    ) -> Result<TaskId, TaskError> {
        self.create_with_timeout(status, task_type, message, self.config.default_timeout)
            .await
    }

    pub async fn create_with_timeout(
        &self,
        status: TaskStatus,
        task_type: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<TaskId, TaskError> {
        let (id, _) = self
            .create_tracked(status, task_type, message, timeout)
            .await?;
        Ok(id)
    }

    /// Register a task and hand back its cancellation receiver.
    pub async fn create_tracked(
        &self,
        status: TaskStatus,
        task_type: &str,
        message: &str,
        timeout: Duration,
    ) -> Result<(TaskId, watch::Receiver<bool>), TaskError> {
        let mut inner = self.inner.write().await;

        if inner.tasks.len() >= self.config.capacity {
            let oldest_finished = inner
                .tasks
                .values()
                .filter(|e| e.task.status.is_finished())
                .min_by_key(|e| (e.task.created_at, e.task.id))
                .map(|e| e.task.id);

            match oldest_finished {
                Some(evicted) => {
                    inner.tasks.remove(&evicted);
                    let limit = self.tombstone_limit();
                    inner.bury(evicted, limit);
                    debug!(task_id = %evicted, "evicted finished task");
                }
                None => {
                    return Err(TaskError::CapacityExceeded {
                        capacity: self.config.capacity,
                    })
                }
            }
        }

        let now = Utc::now();
        let id = TaskId::new();
        let (cancel, signal) = watch::channel(false);
        inner.tasks.insert(
            id,
            Entry {
                task: Task {
                    id,
                    status,
                    task_type: task_type.to_string(),
                    message: message.to_string(),
                    created_at: now,
                    updated_at: now,
                    timeout_secs: timeout.as_secs(),
                },
                cancel,
                finished_at: status.is_finished().then(Instant::now),
            },
        );

        Ok((id, signal))
    }

    /// Move a task to `status`. Finished tasks are final; later updates are ignored.
    pub async fn update(
        &self,
        id: &TaskId,
        status: TaskStatus,
        message: Option<&str>,
    ) -> Result<(), TaskLookupError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.tasks.get_mut(id) else {
            return Err(self.missing(&inner, id));
        };

        if entry.task.status.is_finished() {
            debug!(task_id = %id, status = %status, "ignoring update of finished task");
            return Ok(());
        }

        entry.task.status = status;
        if let Some(message) = message {
            entry.task.message = message.to_string();
        }
        entry.task.updated_at = Utc::now();
        if status.is_finished() {
            entry.finished_at = Some(Instant::now());
        }
        Ok(())
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task, TaskLookupError> {
        let inner = self.inner.read().await;
        match inner.tasks.get(id) {
            Some(entry) if self.is_expired(entry, Instant::now()) => {
                Err(TaskLookupError::Expired(*id))
            }
            Some(entry) => Ok(entry.task.clone()),
            None => Err(self.missing(&inner, id)),
        }
    }

    /// Current tasks, newest first.
    pub async fn list(&self) -> Vec<Task> {
        let inner = self.inner.read().await;
        let now = Instant::now();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|e| !self.is_expired(e, now))
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        tasks
    }

    /// Receiver that flips to `true` when the task is cancelled.
    pub async fn cancel_signal(&self, id: &TaskId) -> Result<watch::Receiver<bool>, TaskLookupError> {
        let inner = self.inner.read().await;
        match inner.tasks.get(id) {
            Some(entry) => Ok(entry.cancel.subscribe()),
            None => Err(self.missing(&inner, id)),
        }
    }

    /// Request cancellation. Returns false if the task already finished.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, TaskLookupError> {
        let inner = self.inner.read().await;
        match inner.tasks.get(id) {
            Some(entry) if entry.task.status.is_finished() => Ok(false),
            Some(entry) => {
                entry.cancel.send_replace(true);
                info!(task_id = %id, "task cancellation requested");
                Ok(true)
            }
            None => Err(self.missing(&inner, id)),
        }
    }

    /// Drop finished tasks older than the TTL. Returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let expired: Vec<TaskId> = inner
            .tasks
            .values()
            .filter(|e| self.is_expired(e, now))
            .map(|e| e.task.id)
            .collect();

        let limit = self.tombstone_limit();
        for id in &expired {
            inner.tasks.remove(id);
            inner.bury(*id, limit);
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    fn missing(&self, inner: &Inner, id: &TaskId) -> TaskLookupError {
        if inner.tombstones.contains(id) {
            TaskLookupError::Expired(*id)
        } else {
            TaskLookupError::NotFound(*id)
        }
    }
}
