use thiserror::Error;
use vmfleet_reconcile::ReconcileError;

use crate::config_mgmt::ConfigMgmtError;
use crate::db::DbError;
use crate::fleet_spec::SpecStoreError;
use crate::hypervisor::HypervisorError;
use crate::provision::ProvisionError;

/// Terminal workflow failures. The display string becomes the task message.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Rejected before any side effect.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Convergence failed, timed out or was refused; intent was rolled back.
    #[error("provisioning failed: {0}")]
    Provision(String),

    #[error(transparent)]
    Hypervisor(#[from] HypervisorError),

    /// The three stores disagree in a way that needs an operator.
    #[error("inconsistent state: {0}")]
    Inconsistent(String),

    #[error("{0}")]
    PollTimeout(String),

    /// The task deadline passed; the value describes the limit.
    #[error("timed out after {0}")]
    TimedOut(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Spec(#[from] SpecStoreError),

    #[error(transparent)]
    Metadata(#[from] DbError),

    #[error(transparent)]
    ConfigMgmt(#[from] ConfigMgmtError),
}

impl From<ProvisionError> for WorkflowError {
    fn from(err: ProvisionError) -> Self {
        Self::Provision(err.to_string())
    }
}

impl From<ReconcileError> for WorkflowError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Timeout { resource, elapsed } => Self::PollTimeout(format!(
                "{resource} did not quiesce within {}s; manual reconciliation required",
                elapsed.as_secs()
            )),
            ReconcileError::Cancelled { .. } => Self::Cancelled,
        }
    }
}
