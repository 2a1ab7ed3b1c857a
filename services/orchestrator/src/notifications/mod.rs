//! User-facing notification feed.
//!
//! Workflows persist one notification per outcome; the HTTP API exposes the
//! feed. Storage lives behind [`NotificationStore`].

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use vmfleet_id::{NotificationId, TaskId};
use vmfleet_reconcile::BulkOutcome;

use crate::db::DbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl From<BulkOutcome> for Severity {
    fn from(outcome: BulkOutcome) -> Self {
        match outcome {
            BulkOutcome::AllSucceeded => Self::Success,
            BulkOutcome::Mixed => Self::Warning,
            BulkOutcome::AllFailed => Self::Error,
        }
    }
}

impl FromStr for Severity {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(DbError::Decode(format!("unknown severity '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: NotificationId::new(),
            severity,
            title: title.into(),
            message: message.into(),
            task_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn push(&self, notification: Notification) -> Result<(), DbError>;

    /// Most recent first.
    async fn recent(&self, limit: usize) -> Result<Vec<Notification>, DbError>;
}

/// Fire-and-log wrapper used by workflows: a failed write is logged, never
/// allowed to change a workflow's outcome.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn NotificationStore>,
}

impl Notifier {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn NotificationStore> {
        &self.store
    }

    pub async fn notify(
        &self,
        task_id: TaskId,
        severity: Severity,
        title: impl Into<String>,
        message: impl Into<String>,
    ) {
        let notification = Notification::new(severity, title, message).for_task(task_id);
        if let Err(e) = self.store.push(notification).await {
            warn!(task_id = %task_id, error = %e, "failed to persist notification");
        }
    }
}
