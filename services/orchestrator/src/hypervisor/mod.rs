//! Hypervisor live state.
//!
//! The [`Hypervisor`] trait is the only way workflows observe or act on
//! running machines. [`ProxmoxClient`] implements it over the Proxmox VE
//! REST API.

mod proxmox;

pub use proxmox::{ProxmoxClient, ProxmoxConfig, Session};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use vmfleet_reconcile::{poll_until, PollConfig, ReconcileError};

#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("hypervisor authentication failed: {0}")]
    Auth(String),

    #[error("hypervisor request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("hypervisor returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The hypervisor refused an action because the VM holds a lock.
    #[error("vm {vmid} is locked: {detail}")]
    Locked { vmid: u32, detail: String },

    #[error("vm {0} not found on any node")]
    VmNotFound(u32),

    /// Some nodes could not be listed, so absence cannot be proven.
    #[error("hypervisor view is incomplete; unreachable nodes: {}", .unreachable.join(", "))]
    Incomplete { unreachable: Vec<String> },

    #[error("unexpected hypervisor response: {0}")]
    InvalidResponse(String),
}

impl HypervisorError {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

/// One listing pass over the cluster. `unreachable` names nodes whose VMs
/// are missing from `vms`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inventory {
    pub vms: Vec<HypervisorVm>,
    pub unreachable: Vec<String>,
}

impl Inventory {
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty()
    }

    /// The full VM list, or [`HypervisorError::Incomplete`] if any node
    /// was skipped.
    pub fn into_complete(self) -> Result<Vec<HypervisorVm>, HypervisorError> {
        if self.is_complete() {
            Ok(self.vms)
        } else {
            Err(HypervisorError::Incomplete {
                unreachable: self.unreachable,
            })
        }
    }

    /// Look a VM up by name. A miss is only an answer when every node
    /// was listed.
    pub fn find_by_name(self, name: &str) -> Result<Option<HypervisorVm>, HypervisorError> {
        if let Some(vm) = self.vms.iter().find(|vm| vm.name == name) {
            return Ok(Some(vm.clone()));
        }
        self.into_complete().map(|_| None)
    }

    /// Node hosting `vmid`, under the same rule as [`Self::find_by_name`].
    pub fn node_of(self, vmid: u32) -> Result<String, HypervisorError> {
        if let Some(vm) = self.vms.iter().find(|vm| vm.vmid == vmid) {
            return Ok(vm.node.clone());
        }
        self.into_complete()?;
        Err(HypervisorError::VmNotFound(vmid))
    }
}

/// A machine as reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorVm {
    pub vmid: u32,
    pub name: String,
    /// Power state, e.g. `running` or `stopped`.
    pub status: String,
    pub node: String,
    /// Active lock (`backup`, `migrate`, ...), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    /// Bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmem: Option<u64>,
}

impl HypervisorVm {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }

    pub fn memory_mib(&self) -> Option<u64> {
        self.maxmem.map(|bytes| bytes / (1024 * 1024))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmAction {
    Start,
    Stop,
    Reset,
}

impl VmAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reset => "reset",
        }
    }
}

impl std::fmt::Display for VmAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Every VM on every reachable node, plus the nodes that were not.
    async fn inventory(&self) -> Result<Inventory, HypervisorError>;

    async fn vm_action(&self, vmid: u32, action: VmAction) -> Result<(), HypervisorError>;

    /// Clear a stale lock on a VM.
    async fn unlock(&self, vmid: u32) -> Result<(), HypervisorError>;

    async fn is_lock_free(&self, vmid: u32) -> Result<bool, HypervisorError>;

    /// Every VM on every node. Fails if any node is unreachable.
    async fn list_vms(&self) -> Result<Vec<HypervisorVm>, HypervisorError> {
        self.inventory().await?.into_complete()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<HypervisorVm>, HypervisorError> {
        self.inventory().await?.find_by_name(name)
    }

    async fn exists(&self, name: &str) -> Result<bool, HypervisorError> {
        Ok(self.find_by_name(name).await?.is_some())
    }

    /// Poll until the named VM reports `stopped`. Returns false on timeout.
    /// A VM that is no longer listed counts as stopped.
    ///
    /// Workflows wait through their own cancellable poll, which also checks
    /// locks; this is the standalone form for callers without a task.
    async fn wait_for_shutdown(
        &self,
        name: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<bool, HypervisorError> {
        let (_keep, mut never) = watch::channel(false);
        let config = PollConfig::new(max_wait, poll_interval);

        let result = poll_until(name, config, &mut never, || async move {
            match self.find_by_name(name).await {
                Ok(Some(vm)) if !vm.is_stopped() => None,
                Ok(_) => Some(Ok(())),
                Err(e) => Some(Err(e)),
            }
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => Err(e),
            Err(ReconcileError::Timeout { .. }) | Err(ReconcileError::Cancelled { .. }) => {
                Ok(false)
            }
        }
    }
}
