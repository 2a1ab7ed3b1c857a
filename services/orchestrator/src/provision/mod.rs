//! Declarative provisioning.
//!
//! A [`Provisioner`] converges real infrastructure to the fleet spec on disk.
//! Every step yields a [`ConvergenceReport`] carrying the tool's combined
//! output so operators see exactly what the tool said.

mod terraform;

pub use terraform::{TerraformConfig, TerraformEngine};

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::fleet_spec::FleetSpec;
use crate::hypervisor::HypervisorVm;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to run {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("could not parse tool output: {0}")]
    Output(String),
}

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvergenceReport {
    pub success: bool,
    pub log: String,
}

impl ConvergenceReport {
    pub fn ok(log: impl Into<String>) -> Self {
        Self {
            success: true,
            log: log.into(),
        }
    }

    pub fn failed(log: impl Into<String>) -> Self {
        Self {
            success: false,
            log: log.into(),
        }
    }

    /// Last `lines` lines of the log, for task messages.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.log.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Prepare the working directory. Idempotent.
    async fn init(&self) -> Result<ConvergenceReport, ProvisionError>;

    /// Preview convergence, refusing plans that would recreate running machines.
    async fn plan(
        &self,
        spec: &FleetSpec,
        live: &[HypervisorVm],
    ) -> Result<ConvergenceReport, ProvisionError>;

    /// Converge the named servers, or the whole fleet when `targets` is empty.
    async fn apply(&self, targets: &[String]) -> Result<ConvergenceReport, ProvisionError>;

    /// Tear down the named servers, or the whole fleet when `targets` is empty.
    async fn destroy(&self, targets: &[String]) -> Result<ConvergenceReport, ProvisionError>;

    /// Tool outputs by name.
    async fn output(&self) -> Result<BTreeMap<String, serde_json::Value>, ProvisionError>;

    /// Server name → hypervisor id, from the `vm_ids` output.
    async fn vm_ids(&self) -> Result<BTreeMap<String, u32>, ProvisionError> {
        let outputs = self.output().await?;
        let Some(entry) = outputs.get("vm_ids") else {
            return Ok(BTreeMap::new());
        };
        let map = entry.get("value").unwrap_or(entry);
        let map = map
            .as_object()
            .ok_or_else(|| ProvisionError::Output("vm_ids is not a map".to_string()))?;

        map.iter()
            .map(|(name, id)| {
                let vmid = id
                    .as_u64()
                    .or_else(|| id.as_str().and_then(|s| s.parse().ok()))
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| ProvisionError::Output(format!("bad vm id for {name}: {id}")))?;
                Ok((name.clone(), vmid))
            })
            .collect()
    }
}

/// Running machines whose live shape no longer matches the spec.
///
/// Applying such a spec would destroy and recreate a running machine.
pub fn drift_guard(spec: &FleetSpec, live: &[HypervisorVm]) -> Vec<String> {
    live.iter()
        .filter(|vm| vm.is_running())
        .filter_map(|vm| {
            let desired = spec.servers.get(&vm.name)?;
            let cpu_drift = vm.cpus.is_some_and(|cpus| cpus != desired.cpu);
            let mem_drift = vm.memory_mib().is_some_and(|mib| mib != desired.memory);
            (cpu_drift || mem_drift).then(|| vm.name.clone())
        })
        .collect()
}

/// Server names the tool reports as `must be replaced` for `resource`.
pub fn replaced_servers(plan_log: &str, resource: &str) -> Vec<String> {
    let prefix = format!("{resource}[\"");
    plan_log
        .lines()
        .filter(|line| line.contains("must be replaced"))
        .filter_map(|line| {
            let start = line.find(&prefix)? + prefix.len();
            let rest = &line[start..];
            let end = rest.find("\"]")?;
            Some(rest[..end].to_string())
        })
        .collect()
}
