use tracing::{info, warn};
use vmfleet_reconcile::Partition;

use super::{BulkAction, Orchestrator, Outcome, TaskContext, WorkflowError};

impl Orchestrator {
    /// Apply a power action to each server in turn. Items succeed or fail
    /// independently; the outcome summarizes the partition.
    pub(super) async fn run_bulk_action(
        &self,
        ctx: &TaskContext,
        action: BulkAction,
        names: Vec<String>,
    ) -> Result<Outcome, WorkflowError> {
        let total = names.len();
        let mut partition: Partition<String> = Partition::new();
        let mut pending = names.into_iter();

        while let Some(name) = pending.next() {
            if ctx.is_cancelled() {
                partition.fail(name, "cancelled");
                for rest in pending.by_ref() {
                    partition.fail(rest, "cancelled");
                }
                break;
            }

            ctx.progress(&format!(
                "{} {name} ({}/{total})",
                action.as_str(),
                partition.len() + 1
            ))
            .await;

            let vmid = match self.inner.metadata.get(&name).await {
                Ok(Some(record)) => record.vmid,
                Ok(None) => {
                    partition.fail(name, "unknown server");
                    continue;
                }
                Err(e) => {
                    partition.fail(name, e.to_string());
                    continue;
                }
            };
            let Some(vmid) = vmid else {
                partition.fail(name, "no vmid recorded");
                continue;
            };

            match self.inner.hypervisor.vm_action(vmid, action.vm_action()).await {
                Ok(()) => {
                    self.set_status(&name, action.resulting_status()).await;
                    info!(server = %name, vmid, action = action.as_str(), "action applied");
                    partition.succeed(name);
                }
                Err(e) => {
                    warn!(server = %name, vmid, action = action.as_str(), error = %e, "action failed");
                    partition.fail(name, e.to_string());
                }
            }
        }

        Ok(Outcome::from_partition(action.as_str(), &partition))
    }
}
