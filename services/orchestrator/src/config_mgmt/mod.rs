//! Post-provision configuration management.
//!
//! Roles are playbooks applied to already-provisioned machines. A role
//! failure never undoes provisioning.

mod ansible;

pub use ansible::{AnsibleConfig, AnsibleRunner};

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigMgmtError {
    #[error("invalid role name '{0}'")]
    InvalidRole(String),

    #[error("no playbook for role '{role}' at {path}")]
    MissingPlaybook { role: String, path: String },

    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("playbook for role '{role}' timed out after {secs}s")]
    Timeout { role: String, secs: u64 },

    #[error("failed to write inventory: {0}")]
    Inventory(#[source] std::io::Error),
}

/// A host the playbook runs against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleTarget {
    pub name: String,
    /// Management address. Without one the inventory falls back to the name.
    pub address: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleReport {
    pub success: bool,
    /// True when no playbook ran (role removal).
    pub skipped: bool,
    pub log: String,
}

impl RoleReport {
    pub fn skipped() -> Self {
        Self {
            success: true,
            skipped: true,
            log: String::new(),
        }
    }
}

/// Returns true when `role` means "remove the role".
pub fn is_role_removal(role: Option<&str>) -> bool {
    role.map(str::trim).is_none_or(str::is_empty)
}

#[async_trait]
pub trait RoleRunner: Send + Sync {
    /// Apply `role` to every target in one playbook run.
    async fn assign_role(
        &self,
        targets: &[RoleTarget],
        role: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<RoleReport, ConfigMgmtError>;
}
