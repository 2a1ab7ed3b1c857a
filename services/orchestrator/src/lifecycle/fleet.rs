use std::collections::BTreeMap;

use tracing::{info, warn};
use vmfleet_reconcile::Partition;

use super::{Orchestrator, Outcome, TaskContext, WorkflowError};
use crate::config_mgmt::is_role_removal;
use crate::db::{NewServerRecord, ServerStatus};

impl Orchestrator {
    pub(super) async fn run_assign_role(
        &self,
        ctx: &TaskContext,
        names: Vec<String>,
        role: Option<String>,
        vars: BTreeMap<String, String>,
    ) -> Result<Outcome, WorkflowError> {
        if names.is_empty() {
            return Err(WorkflowError::Validation("no servers given".to_string()));
        }

        let mut partition: Partition<String> = Partition::new();
        let mut servers = Vec::new();
        for name in names {
            let record = self.inner.metadata.get(&name).await?;
            let spec = self.inner.specs.get(&name).await?;
            match (record, spec) {
                (Some(_), Some(spec)) => servers.push((name, spec)),
                (None, _) => partition.fail(name, "unknown server"),
                (Some(_), None) => partition.fail(name, "server has no spec entry"),
            }
        }

        if is_role_removal(role.as_deref()) {
            for (name, _) in servers {
                self.record_role(&name, None).await;
                partition.succeed(name);
            }
            return Ok(Outcome::from_partition("remove role", &partition));
        }

        let role = role.unwrap_or_default();
        let verb = format!("assign role {role}");
        if servers.is_empty() {
            return Ok(Outcome::from_partition(&verb, &partition));
        }
        ctx.ensure_active()?;

        ctx.progress(&format!("running playbook {role}")).await;
        match self.apply_role(ctx, &servers, &role, &vars).await {
            Ok(()) => {
                for (name, _) in servers {
                    partition.succeed(name);
                }
                Ok(Outcome::from_partition(&verb, &partition))
            }
            Err(reason) => {
                // Machines are untouched by a failed playbook.
                let names: Vec<&str> = servers.iter().map(|(n, _)| n.as_str()).collect();
                Ok(Outcome::degraded(format!(
                    "{verb} failed on {}: {reason}",
                    names.join(", ")
                )))
            }
        }
    }

    /// Plan against live state, converge the whole fleet, then refresh the
    /// metadata cache from the hypervisor.
    pub(super) async fn run_reconcile(&self, ctx: &TaskContext) -> Result<Outcome, WorkflowError> {
        ctx.progress("planning").await;
        let doc = self.inner.specs.load().await?.doc;
        let live = self.inner.hypervisor.list_vms().await?;

        let init = self.inner.provisioner.init().await?;
        if !init.success {
            return Err(WorkflowError::Provision(format!("init failed: {}", init.tail(20))));
        }
        let plan = self.inner.provisioner.plan(&doc, &live).await?;
        if !plan.success {
            return Err(WorkflowError::Provision(format!("plan refused: {}", plan.tail(20))));
        }
        ctx.ensure_active()?;

        ctx.progress("applying").await;
        self.converge(ctx, &[]).await?;

        ctx.progress("refreshing metadata").await;
        let live = self.inner.hypervisor.list_vms().await?;
        let mut refreshed = 0usize;
        let mut adopted = Vec::new();
        for (name, spec) in &doc.servers {
            let Some(vm) = live.iter().find(|vm| &vm.name == name) else {
                warn!(server = %name, "in spec but not on the hypervisor after apply");
                continue;
            };
            let status = ServerStatus::from_power_state(&vm.status);
            if self.inner.metadata.set_status(name, status).await? {
                refreshed += 1;
                continue;
            }
            self.inner
                .metadata
                .insert(NewServerRecord {
                    name: name.clone(),
                    vmid: Some(vm.vmid),
                    status,
                    ip_address: spec.primary_ip(),
                    role: spec.role.clone(),
                    firewall_group: spec.firewall_group.clone(),
                    os_type: spec.os_type.clone(),
                    cpu: spec.cpu,
                    memory: spec.memory,
                })
                .await?;
            adopted.push(name.clone());
        }

        info!(refreshed, adopted = adopted.len(), "fleet reconciled");
        let mut message = format!(
            "fleet converged: {} servers in spec, {refreshed} records refreshed",
            doc.servers.len()
        );
        if !adopted.is_empty() {
            message.push_str(&format!(", adopted {}", adopted.join(", ")));
        }
        Ok(Outcome::success(message))
    }
}
