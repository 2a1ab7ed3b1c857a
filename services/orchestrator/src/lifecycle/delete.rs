use tracing::{debug, info, warn};
use vmfleet_reconcile::{poll_until, sleep_or_cancel};

use super::{Orchestrator, Outcome, ServerPhase, TaskContext, WorkflowError};
use crate::db::ServerStatus;
use crate::hypervisor::{HypervisorError, VmAction};

impl Orchestrator {
    /// Stop a VM, clearing a held lock and retrying exactly once.
    async fn stop_vm(&self, name: &str, vmid: u32) -> Result<(), WorkflowError> {
        let hypervisor = &self.inner.hypervisor;
        match hypervisor.vm_action(vmid, VmAction::Stop).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_locked() => {
                warn!(server = name, vmid, error = %e, "stop refused by lock; unlocking and retrying once");
                hypervisor.unlock(vmid).await?;
                hypervisor.vm_action(vmid, VmAction::Stop).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until the VM is stopped and holds no lock. A VM that vanished
    /// from the listing counts as quiesced.
    async fn wait_quiesced(
        &self,
        ctx: &mut TaskContext,
        name: &str,
        vmid: u32,
    ) -> Result<(), WorkflowError> {
        let hypervisor = self.inner.hypervisor.clone();
        let resource = format!("server '{name}'");
        let config = self.inner.settings.quiesce;

        poll_until(&resource, config, ctx.cancel_signal(), || {
            let hypervisor = hypervisor.clone();
            async move {
                let vm = match hypervisor.list_vms().await {
                    Ok(vms) => vms.into_iter().find(|vm| vm.vmid == vmid),
                    Err(e) => {
                        warn!(vmid, error = %e, "status poll failed");
                        return None;
                    }
                };
                let Some(vm) = vm else {
                    return Some(());
                };
                if !vm.is_stopped() {
                    debug!(vmid, status = %vm.status, "waiting for stop");
                    return None;
                }
                match hypervisor.is_lock_free(vmid).await {
                    Ok(true) => Some(()),
                    Ok(false) => {
                        debug!(vmid, "waiting for lock release");
                        None
                    }
                    Err(HypervisorError::VmNotFound(_)) => Some(()),
                    Err(e) => {
                        warn!(vmid, error = %e, "lock poll failed");
                        None
                    }
                }
            }
        })
        .await?;
        Ok(())
    }

    pub(super) async fn run_delete(
        &self,
        ctx: &mut TaskContext,
        name: &str,
    ) -> Result<Outcome, WorkflowError> {
        let record = self.inner.metadata.get(name).await?;

        let Some(vmid) = record.as_ref().and_then(|r| r.vmid) else {
            // No vmid on record: only the hypervisor can say whether it is gone.
            ctx.progress("checking hypervisor").await;
            if self.inner.hypervisor.exists(name).await? {
                ServerPhase::Error.enter(name);
                return Err(WorkflowError::Inconsistent(format!(
                    "server '{name}' exists on the hypervisor but has no recorded vmid; \
                     reconcile it manually before deleting"
                )));
            }
            // Nothing running. A spec entry without a record belongs to a
            // create still in flight and is left alone.
            if record.is_some() {
                self.inner.metadata.delete(name).await?;
            }
            ServerPhase::AbsentConfirmed.enter(name);
            return Ok(Outcome::success(format!("server '{name}' is already absent")));
        };

        ServerPhase::Stopping.enter(name);
        ctx.progress(&format!("stopping vmid {vmid}")).await;
        match self.stop_vm(name, vmid).await {
            Ok(()) => {
                ctx.progress("waiting for shutdown and lock release").await;
                if let Err(e) = self.wait_quiesced(ctx, name, vmid).await {
                    ServerPhase::Error.enter(name);
                    return Err(e);
                }
            }
            Err(WorkflowError::Hypervisor(HypervisorError::VmNotFound(_))) => {
                // Removed behind our back. The name must be gone as well.
                if self.inner.hypervisor.exists(name).await? {
                    ServerPhase::Error.enter(name);
                    return Err(WorkflowError::Inconsistent(format!(
                        "server '{name}' is recorded as vmid {vmid} but runs under another id"
                    )));
                }
                warn!(server = name, vmid, "vm already gone from the hypervisor; cleaning up records");
            }
            Err(e) => return Err(e),
        }
        ctx.ensure_active()?;

        ctx.progress("destroying").await;
        let removed = self.inner.specs.remove(name).await?;
        self.set_status(name, ServerStatus::Deleting).await;

        let targets = vec![name.to_string()];
        if let Err(e) = self.converge(ctx, &targets).await {
            if let Some(spec) = removed {
                if let Err(restore) = self.inner.specs.restore(vec![(name.to_string(), spec)]).await {
                    warn!(server = name, error = %restore, "failed to restore spec after failed destroy");
                }
            }
            self.set_status(name, ServerStatus::Error).await;
            ServerPhase::Error.enter(name);
            return Err(e);
        }

        self.inner.metadata.delete(name).await?;
        ServerPhase::AbsentConfirmed.enter(name);
        Ok(Outcome::success(format!("server '{name}' (vmid {vmid}) deleted")))
    }

    pub(super) async fn run_bulk_delete(
        &self,
        ctx: &mut TaskContext,
        names: Vec<String>,
    ) -> Result<Outcome, WorkflowError> {
        if names.is_empty() {
            return Err(WorkflowError::Validation("no servers given".to_string()));
        }

        ctx.progress(&format!("stopping {} servers", names.len()))
            .await;
        for name in &names {
            ServerPhase::Stopping.enter(name);
            let vmid = match self.inner.metadata.get(name).await {
                Ok(record) => record.and_then(|r| r.vmid),
                Err(e) => {
                    warn!(server = %name, error = %e, "metadata lookup failed; skipping stop");
                    None
                }
            };
            if let Some(vmid) = vmid {
                if let Err(e) = self.inner.hypervisor.vm_action(vmid, VmAction::Stop).await {
                    warn!(server = %name, vmid, error = %e, "best-effort stop failed");
                }
            }
        }

        let grace = self.inner.settings.bulk_delete_grace;
        ctx.progress(&format!("waiting {}s for shutdown", grace.as_secs()))
            .await;
        let resource = format!("bulk delete of {} servers", names.len());
        sleep_or_cancel(grace, ctx.cancel_signal(), &resource).await?;

        ctx.progress("destroying").await;
        let removed = self.inner.specs.remove_many(&names).await?;

        let destroyed = ctx
            .bounded(async {
                let init = self.inner.provisioner.init().await?;
                if !init.success {
                    return Err(WorkflowError::Provision(format!(
                        "init failed: {}",
                        init.tail(20)
                    )));
                }
                let report = self.inner.provisioner.destroy(&names).await?;
                if !report.success {
                    return Err(WorkflowError::Provision(report.tail(20)));
                }
                Ok(())
            })
            .await;

        if let Err(e) = destroyed {
            let restored = removed.len();
            if let Err(restore) = self.inner.specs.restore(removed).await {
                warn!(error = %restore, "failed to restore specs after failed destroy");
            } else {
                info!(restored, "restored specs after failed destroy");
            }
            return Err(e);
        }

        for name in &names {
            if let Err(e) = self.inner.metadata.delete(name).await {
                warn!(server = %name, error = %e, "failed to delete metadata record");
            }
            ServerPhase::AbsentConfirmed.enter(name);
        }

        Ok(Outcome::success(format!(
            "deleted {} servers: {}",
            names.len(),
            names.join(", ")
        )))
    }

    pub(super) async fn set_status(&self, name: &str, status: ServerStatus) {
        if let Err(e) = self.inner.metadata.set_status(name, status).await {
            warn!(server = name, status = %status, error = %e, "failed to update server status");
        }
    }
}
