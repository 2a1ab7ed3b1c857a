use std::collections::{BTreeMap, HashSet};

use tracing::{debug, warn};
use vmfleet_reconcile::Partition;

use super::{CreateServer, Orchestrator, Outcome, ServerPhase, TaskContext, WorkflowError};
use crate::config_mgmt::{is_role_removal, RoleTarget};
use crate::db::{NewServerRecord, ServerStatus};
use crate::fleet_spec::{ServerSpec, SpecStoreError};
use crate::hypervisor::HypervisorVm;
use crate::notifications::Severity;

/// Server names end up in provisioning addresses and inventories.
fn valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn record_for(name: &str, spec: &ServerSpec, vm: &HypervisorVm) -> NewServerRecord {
    NewServerRecord {
        name: name.to_string(),
        vmid: Some(vm.vmid),
        status: ServerStatus::from_power_state(&vm.status),
        ip_address: spec.primary_ip(),
        role: None,
        firewall_group: spec.firewall_group.clone(),
        os_type: spec.os_type.clone(),
        cpu: spec.cpu,
        memory: spec.memory,
    }
}

impl Orchestrator {
    /// Reject names already known to either store and incomplete specs.
    pub(super) async fn validate_new(
        &self,
        name: &str,
        spec: &ServerSpec,
    ) -> Result<(), WorkflowError> {
        if name.trim().is_empty() {
            return Err(WorkflowError::Validation("server name is required".to_string()));
        }
        if !valid_server_name(name) {
            return Err(WorkflowError::Validation(format!(
                "invalid server name '{name}': use letters, digits, '-', '_' or '.'"
            )));
        }
        if self.inner.specs.contains(name).await? {
            return Err(WorkflowError::Validation(format!(
                "server '{name}' already exists in the fleet spec"
            )));
        }
        if self.inner.metadata.exists(name).await? {
            return Err(WorkflowError::Validation(format!(
                "server '{name}' already exists in the metadata store"
            )));
        }

        let missing = spec.missing_fields();
        if !missing.is_empty() {
            return Err(WorkflowError::Validation(format!(
                "server '{name}' is missing required fields: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Remove specs written by a failed create. Failures are logged only.
    pub(super) async fn rollback_specs(&self, names: &[String]) {
        match self.inner.specs.remove_many(names).await {
            Ok(removed) => {
                for (name, _) in removed {
                    ServerPhase::Absent.enter(&name);
                }
            }
            Err(e) => warn!(servers = ?names, error = %e, "failed to roll back server specs"),
        }
    }

    /// Compare the hypervisor's id with the provisioning tool's `vm_ids`
    /// output. The hypervisor wins; a mismatch is only logged.
    async fn check_tool_vmid(&self, name: &str, vmid: u32) {
        match self.inner.provisioner.vm_ids().await {
            Ok(ids) => match ids.get(name) {
                Some(&reported) if reported != vmid => warn!(
                    server = name,
                    vmid,
                    reported,
                    "provisioning tool reports a different vmid; recording the hypervisor's"
                ),
                Some(_) => {}
                None => debug!(server = name, "no vmid in provisioning outputs"),
            },
            Err(e) => debug!(server = name, error = %e, "could not read provisioning outputs"),
        }
    }

    /// Run a role playbook and record the role on success.
    pub(super) async fn apply_role(
        &self,
        ctx: &TaskContext,
        servers: &[(String, ServerSpec)],
        role: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        let targets: Vec<RoleTarget> = servers
            .iter()
            .map(|(name, spec)| RoleTarget {
                name: name.clone(),
                address: spec.primary_ip(),
                username: spec.vm_username.clone(),
                password: spec.vm_password.clone(),
            })
            .collect();

        let report = ctx
            .bounded(async {
                self.inner
                    .roles
                    .assign_role(&targets, role, vars)
                    .await
                    .map_err(WorkflowError::from)
            })
            .await
            .map_err(|e| e.to_string())?;
        if !report.success {
            let tail: Vec<&str> = report.log.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            return Err(format!("playbook failed: {}", tail.join(" | ")));
        }

        for (name, _) in servers {
            self.record_role(name, Some(role)).await;
            ServerPhase::RoleAssigned.enter(name);
        }
        Ok(())
    }

    /// Write a role to both the metadata record and the spec.
    pub(super) async fn record_role(&self, name: &str, role: Option<&str>) {
        if let Err(e) = self.inner.metadata.set_role(name, role).await {
            warn!(server = name, error = %e, "failed to record role in metadata");
        }
        if let Err(e) = self.inner.specs.set_role(name, role).await {
            warn!(server = name, error = %e, "failed to record role in spec");
        }
    }

    pub(super) async fn run_create(
        &self,
        ctx: &TaskContext,
        request: CreateServer,
    ) -> Result<Outcome, WorkflowError> {
        let CreateServer {
            name,
            spec,
            role_vars,
        } = request;
        ServerPhase::Absent.enter(&name);

        ctx.progress("validating").await;
        self.validate_new(&name, &spec).await?;
        ctx.ensure_active()?;

        // Validation read the spec without the writer lock; a concurrent
        // create of the same name is caught here.
        let stored = match self.inner.specs.insert_new(&name, spec).await {
            Ok(stored) => stored,
            Err(e @ SpecStoreError::Duplicate(_)) => {
                return Err(WorkflowError::Validation(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        ServerPhase::SpecWritten.enter(&name);

        ctx.progress("provisioning").await;
        let targets = vec![name.clone()];
        if let Err(e) = self.converge(ctx, &targets).await {
            self.rollback_specs(&targets).await;
            ServerPhase::Error.enter(&name);
            return Err(e);
        }

        let vm = match self.inner.hypervisor.find_by_name(&name).await {
            Ok(Some(vm)) => vm,
            Ok(None) => {
                self.rollback_specs(&targets).await;
                ServerPhase::Error.enter(&name);
                return Err(WorkflowError::Provision(format!(
                    "server '{name}' was not reported by the hypervisor after apply"
                )));
            }
            Err(e) => {
                // Intent stays: the machine may exist.
                ServerPhase::Error.enter(&name);
                return Err(e.into());
            }
        };
        ServerPhase::Provisioned.enter(&name);
        self.check_tool_vmid(&name, vm.vmid).await;

        self.inner
            .metadata
            .insert(record_for(&name, &stored, &vm))
            .await?;

        let created = format!("server '{name}' created (vmid {})", vm.vmid);
        let Some(role) = stored.role.clone().filter(|r| !is_role_removal(Some(r))) else {
            return Ok(Outcome::success(created));
        };

        ctx.progress(&format!("assigning role {role}")).await;
        match self
            .apply_role(ctx, &[(name.clone(), stored)], &role, &role_vars)
            .await
        {
            Ok(()) => Ok(Outcome::success(format!("{created} with role {role}"))),
            Err(reason) => Ok(Outcome::degraded(format!(
                "{created}, but role {role} failed: {reason}"
            ))),
        }
    }

    pub(super) async fn run_bulk_create(
        &self,
        ctx: &TaskContext,
        requests: Vec<CreateServer>,
    ) -> Result<Outcome, WorkflowError> {
        let mut partition: Partition<String> = Partition::new();
        let mut accepted: Vec<CreateServer> = Vec::new();
        let mut seen = HashSet::new();

        ctx.progress(&format!("validating {} servers", requests.len()))
            .await;
        for request in requests {
            if !seen.insert(request.name.clone()) {
                partition.fail(request.name, "duplicate name in request");
                continue;
            }
            match self.validate_new(&request.name, &request.spec).await {
                Ok(()) => accepted.push(request),
                Err(e) => partition.fail(request.name, e.to_string()),
            }
        }
        if accepted.is_empty() {
            return Ok(Outcome::from_partition("create", &partition));
        }
        ctx.ensure_active()?;

        let (stored, taken) = self
            .inner
            .specs
            .insert_absent(
                accepted
                    .iter()
                    .map(|r| (r.name.clone(), r.spec.clone()))
                    .collect(),
            )
            .await?;
        for name in taken {
            accepted.retain(|r| r.name != name);
            let reason = SpecStoreError::Duplicate(name.clone()).to_string();
            partition.fail(name, reason);
        }
        if accepted.is_empty() {
            return Ok(Outcome::from_partition("create", &partition));
        }
        let names: Vec<String> = accepted.iter().map(|r| r.name.clone()).collect();
        for name in &names {
            ServerPhase::SpecWritten.enter(name);
        }

        ctx.progress(&format!("provisioning {}", names.join(", ")))
            .await;
        if let Err(e) = self.converge(ctx, &names).await {
            self.rollback_specs(&names).await;
            let reason = e.to_string();
            for name in names {
                ServerPhase::Error.enter(&name);
                partition.fail(name, reason.clone());
            }
            return Ok(Outcome::from_partition("create", &partition));
        }

        let live = match self.inner.hypervisor.inventory().await {
            Ok(live) => live,
            Err(e) => {
                let reason = format!("hypervisor query failed after apply: {e}");
                for name in names {
                    partition.fail(name, reason.clone());
                }
                return Ok(Outcome::from_partition("create", &partition));
            }
        };

        let mut role_failures = Vec::new();
        for (request, (name, spec)) in accepted.iter().zip(stored) {
            let vm = match live.clone().find_by_name(&name) {
                Ok(Some(vm)) => vm,
                Ok(None) => {
                    self.rollback_specs(std::slice::from_ref(&name)).await;
                    ServerPhase::Error.enter(&name);
                    partition.fail(name, "not reported by the hypervisor after apply");
                    continue;
                }
                Err(e) => {
                    // Intent stays: the machine may be on an unreachable node.
                    ServerPhase::Error.enter(&name);
                    partition.fail(name, e.to_string());
                    continue;
                }
            };
            ServerPhase::Provisioned.enter(&name);

            if let Err(e) = self.inner.metadata.insert(record_for(&name, &spec, &vm)).await {
                partition.fail(name, e.to_string());
                continue;
            }

            if let Some(role) = spec.role.clone().filter(|r| !is_role_removal(Some(r))) {
                if let Err(reason) = self
                    .apply_role(ctx, &[(name.clone(), spec)], &role, &request.role_vars)
                    .await
                {
                    role_failures.push(format!("{name}: role {role} failed: {reason}"));
                }
            }
            partition.succeed(name);
        }

        let mut outcome = Outcome::from_partition("create", &partition);
        if !role_failures.is_empty() {
            outcome
                .message
                .push_str(&format!("; {}", role_failures.join("; ")));
            if outcome.severity == Severity::Success {
                outcome.severity = Severity::Warning;
            }
        }
        Ok(outcome)
    }
}
