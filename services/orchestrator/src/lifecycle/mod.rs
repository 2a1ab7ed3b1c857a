//! Lifecycle orchestration.
//!
//! Every public operation registers a task, spawns a worker and returns the
//! task id immediately. Workers walk a server through
//! `absent → spec_written → provisioned → role_assigned` on create and
//! `stopping → absent_confirmed` on delete, keeping the fleet spec, the
//! metadata cache and the hypervisor converged.
//!
//! # Concurrency
//!
//! - A semaphore bounds running workers; queued tasks stay `pending`.
//! - Each worker stops at the task deadline at every long wait, rolling
//!   back like any other failure, and observes its cancellation signal.
//! - Convergence itself is serialized inside the provisioner.

mod bulk;
mod create;
mod delete;
mod error;
mod fleet;

pub use error::WorkflowError;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use vmfleet_id::TaskId;
use vmfleet_reconcile::{BulkOutcome, Partition, PollConfig};

use crate::config_mgmt::RoleRunner;
use crate::db::{MetadataStore, ServerStatus};
use crate::fleet_spec::{FleetSpecStore, ServerSpec};
use crate::hypervisor::{Hypervisor, VmAction};
use crate::notifications::{NotificationStore, Notifier, Severity};
use crate::provision::Provisioner;
use crate::tasks::{TaskError, TaskRegistry, TaskStatus};

/// Request to create one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateServer {
    pub name: String,
    #[serde(flatten)]
    pub spec: ServerSpec,
    /// Extra variables passed to the role playbook.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub role_vars: BTreeMap<String, String>,
}

/// Power action applied to many servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkAction {
    Start,
    Stop,
    Reboot,
}

impl BulkAction {
    pub fn vm_action(self) -> VmAction {
        match self {
            Self::Start => VmAction::Start,
            Self::Stop => VmAction::Stop,
            Self::Reboot => VmAction::Reset,
        }
    }

    /// Record status after the action succeeded.
    pub fn resulting_status(self) -> ServerStatus {
        match self {
            Self::Start | Self::Reboot => ServerStatus::Running,
            Self::Stop => ServerStatus::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
        }
    }
}

/// Per-server lifecycle phase, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Absent,
    SpecWritten,
    Provisioned,
    RoleAssigned,
    Stopping,
    AbsentConfirmed,
    Error,
}

impl ServerPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::SpecWritten => "spec_written",
            Self::Provisioned => "provisioned",
            Self::RoleAssigned => "role_assigned",
            Self::Stopping => "stopping",
            Self::AbsentConfirmed => "absent_confirmed",
            Self::Error => "error",
        }
    }

    pub(crate) fn enter(self, server: &str) {
        info!(server, phase = self.as_str(), "server phase");
    }
}

/// How a workflow ended, as written to the task and the notification feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: TaskStatus,
    pub severity: Severity,
    pub message: String,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            severity: Severity::Success,
            message: message.into(),
        }
    }

    /// Task succeeded, but something non-fatal (e.g. a role) failed.
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Error,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    /// Summary of a bulk operation. The task fails only if every item failed.
    pub fn from_partition(verb: &str, partition: &Partition<String>) -> Self {
        let mut message = format!(
            "{verb}: {}/{} succeeded",
            partition.succeeded.len(),
            partition.len()
        );
        if !partition.succeeded.is_empty() {
            message.push_str(&format!(" [{}]", partition.succeeded.join(", ")));
        }
        if !partition.failed.is_empty() {
            let failures: Vec<String> = partition
                .failed
                .iter()
                .map(|(name, reason)| format!("{name}: {reason}"))
                .collect();
            message.push_str(&format!("; failed: {}", failures.join("; ")));
        }

        let outcome = partition.outcome();
        Self {
            status: if outcome == BulkOutcome::AllFailed && !partition.is_empty() {
                TaskStatus::Error
            } else {
                TaskStatus::Success
            },
            severity: outcome.into(),
            message,
        }
    }
}

/// Slack past the task deadline before a worker is dropped outright.
/// Workflows normally stop at their own deadline and roll back.
const HARD_STOP_GRACE: Duration = Duration::from_secs(5);

/// `250ms`, `30s`.
pub(crate) fn describe_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Handle passed to a running workflow.
pub struct TaskContext {
    id: TaskId,
    cancel: watch::Receiver<bool>,
    tasks: Arc<TaskRegistry>,
    deadline: Instant,
    timeout: Duration,
}

impl TaskContext {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub async fn progress(&self, message: &str) {
        if let Err(e) = self
            .tasks
            .update(&self.id, TaskStatus::Progress, Some(message))
            .await
        {
            warn!(task_id = %self.id, error = %e, "failed to record progress");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        vmfleet_reconcile::is_cancelled(&self.cancel)
    }

    pub fn ensure_active(&self) -> Result<(), WorkflowError> {
        if self.is_cancelled() {
            Err(WorkflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel_signal(&mut self) -> &mut watch::Receiver<bool> {
        &mut self.cancel
    }

    /// Run `work` until the task deadline. On expiry `work` is dropped and
    /// the caller gets [`WorkflowError::TimedOut`], leaving it free to roll
    /// back.
    pub async fn bounded<T, F>(&self, work: F) -> Result<T, WorkflowError>
    where
        F: Future<Output = Result<T, WorkflowError>>,
    {
        match tokio::time::timeout_at(self.deadline, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %self.id, timeout_ms = self.timeout.as_millis() as u64, "task deadline reached");
                Err(WorkflowError::TimedOut(describe_duration(self.timeout)))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Window for a VM to reach stopped and lock-free before delete.
    pub quiesce: PollConfig,
    /// Fixed wait between stopping and destroying in a bulk delete.
    pub bulk_delete_grace: Duration,
    pub max_concurrent_tasks: usize,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            quiesce: PollConfig::default(),
            bulk_delete_grace: Duration::from_secs(15),
            max_concurrent_tasks: 4,
        }
    }
}

/// Collaborators the orchestrator drives.
pub struct Components {
    pub specs: Arc<FleetSpecStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub hypervisor: Arc<dyn Hypervisor>,
    pub provisioner: Arc<dyn Provisioner>,
    pub roles: Arc<dyn RoleRunner>,
    pub notifications: Arc<dyn NotificationStore>,
    pub tasks: Arc<TaskRegistry>,
}

struct Inner {
    specs: Arc<FleetSpecStore>,
    metadata: Arc<dyn MetadataStore>,
    hypervisor: Arc<dyn Hypervisor>,
    provisioner: Arc<dyn Provisioner>,
    roles: Arc<dyn RoleRunner>,
    tasks: Arc<TaskRegistry>,
    notifier: Notifier,
    slots: Arc<Semaphore>,
    settings: LifecycleSettings,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(components: Components, settings: LifecycleSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                specs: components.specs,
                metadata: components.metadata,
                hypervisor: components.hypervisor,
                provisioner: components.provisioner,
                roles: components.roles,
                tasks: components.tasks,
                notifier: Notifier::new(components.notifications),
                slots: Arc::new(Semaphore::new(settings.max_concurrent_tasks.max(1))),
                settings,
            }),
        }
    }

    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.inner.tasks
    }

    pub fn specs(&self) -> &Arc<FleetSpecStore> {
        &self.inner.specs
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.inner.metadata
    }

    pub fn notifications(&self) -> &Arc<dyn NotificationStore> {
        self.inner.notifier.store()
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.inner.settings
    }

    /// Register a task and run `work` for it in the background.
    async fn submit<F, Fut>(
        &self,
        task_type: &'static str,
        subject: String,
        work: F,
    ) -> Result<TaskId, TaskError>
    where
        F: FnOnce(Orchestrator, TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Outcome, WorkflowError>> + Send + 'static,
    {
        let tasks = self.inner.tasks.clone();
        let timeout = tasks.config().default_timeout;
        let (id, mut cancel) = tasks
            .create_tracked(TaskStatus::Pending, task_type, &format!("queued: {subject}"), timeout)
            .await?;

        let this = self.clone();
        let span = info_span!("task", task_id = %id, task_type, subject = %subject);
        tokio::spawn(
            async move {
                let permit = tokio::select! {
                    permit = this.inner.slots.clone().acquire_owned() => permit.ok(),
                    _ = wait_cancelled(&mut cancel) => None,
                };

                let outcome = match permit {
                    None => Outcome::failure("cancelled before start"),
                    Some(_permit) => {
                        info!("task started");
                        if let Err(e) = tasks.update(&id, TaskStatus::Progress, Some("started")).await {
                            warn!(error = %e, "task vanished before start");
                        }
                        let ctx = TaskContext {
                            id,
                            cancel,
                            tasks: tasks.clone(),
                            deadline: Instant::now() + timeout,
                            timeout,
                        };
                        let hard_stop = timeout + HARD_STOP_GRACE;
                        match tokio::time::timeout(hard_stop, work(this.clone(), ctx)).await {
                            Ok(Ok(outcome)) => outcome,
                            Ok(Err(e)) => {
                                warn!(error = %e, "workflow failed");
                                Outcome::failure(e.to_string())
                            }
                            Err(_) => {
                                warn!(
                                    timeout_ms = hard_stop.as_millis() as u64,
                                    "workflow ignored its deadline and was dropped"
                                );
                                Outcome::failure(format!(
                                    "timed out after {}; state may need reconciliation",
                                    describe_duration(hard_stop)
                                ))
                            }
                        }
                    }
                };

                // Notify first so a finished task always has its notification.
                this.inner
                    .notifier
                    .notify(
                        id,
                        outcome.severity,
                        format!("{task_type}: {subject}"),
                        outcome.message.clone(),
                    )
                    .await;
                info!(status = %outcome.status, "task finished");
                if let Err(e) = tasks
                    .update(&id, outcome.status, Some(&outcome.message))
                    .await
                {
                    warn!(error = %e, "could not record task result");
                }
            }
            .instrument(span),
        );

        Ok(id)
    }

    pub async fn create_server(&self, request: CreateServer) -> Result<TaskId, TaskError> {
        let subject = request.name.clone();
        self.submit("create_server", subject, move |this, ctx| async move {
            this.run_create(&ctx, request).await
        })
        .await
    }

    pub async fn create_servers(&self, requests: Vec<CreateServer>) -> Result<TaskId, TaskError> {
        let subject = format!("{} servers", requests.len());
        self.submit("bulk_create", subject, move |this, ctx| async move {
            this.run_bulk_create(&ctx, requests).await
        })
        .await
    }

    pub async fn delete_server(&self, name: String) -> Result<TaskId, TaskError> {
        self.submit("delete_server", name.clone(), move |this, mut ctx| async move {
            this.run_delete(&mut ctx, &name).await
        })
        .await
    }

    pub async fn delete_servers(&self, names: Vec<String>) -> Result<TaskId, TaskError> {
        let subject = format!("{} servers", names.len());
        self.submit("bulk_delete", subject, move |this, mut ctx| async move {
            this.run_bulk_delete(&mut ctx, names).await
        })
        .await
    }

    pub async fn bulk_action(
        &self,
        action: BulkAction,
        names: Vec<String>,
    ) -> Result<TaskId, TaskError> {
        let subject = format!("{} {} servers", action.as_str(), names.len());
        self.submit("bulk_action", subject, move |this, ctx| async move {
            this.run_bulk_action(&ctx, action, names).await
        })
        .await
    }

    /// Apply (or, with an empty role, remove) a role on existing servers.
    pub async fn assign_role(
        &self,
        names: Vec<String>,
        role: Option<String>,
        vars: BTreeMap<String, String>,
    ) -> Result<TaskId, TaskError> {
        let subject = format!(
            "{} on {}",
            role.as_deref().unwrap_or("<none>"),
            names.join(",")
        );
        self.submit("assign_role", subject, move |this, ctx| async move {
            this.run_assign_role(&ctx, names, role, vars).await
        })
        .await
    }

    /// Plan, then converge the whole fleet to the spec.
    pub async fn reconcile(&self) -> Result<TaskId, TaskError> {
        self.submit("reconcile", "fleet".to_string(), move |this, ctx| async move {
            this.run_reconcile(&ctx).await
        })
        .await
    }

    /// `init` + targeted `apply` within the task deadline, failing on an
    /// unsuccessful report.
    async fn converge(&self, ctx: &TaskContext, targets: &[String]) -> Result<(), WorkflowError> {
        ctx.bounded(async {
            let init = self.inner.provisioner.init().await?;
            if !init.success {
                return Err(WorkflowError::Provision(format!("init failed: {}", init.tail(20))));
            }
            let report = self.inner.provisioner.apply(targets).await?;
            if !report.success {
                return Err(WorkflowError::Provision(report.tail(20)));
            }
            Ok(())
        })
        .await
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
