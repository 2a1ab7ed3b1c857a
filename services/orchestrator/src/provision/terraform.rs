//! Terraform/OpenTofu driver.
//!
//! All invocations go through one convergence queue, so at most one tool
//! process touches the state at a time. The tool's own state lock is
//! disabled (`-lock=false`); a lock artifact left behind by a crashed run
//! is reported at startup and never removed here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::{drift_guard, replaced_servers, ConvergenceReport, ProvisionError, Provisioner};
use crate::fleet_spec::FleetSpec;
use crate::hypervisor::HypervisorVm;

/// Lock file written by the tool next to local state.
const LOCK_ARTIFACT: &str = ".terraform.tfstate.lock.info";

#[derive(Debug, Clone)]
pub struct TerraformConfig {
    /// `terraform` or `tofu`, or a path to either.
    pub binary: PathBuf,
    /// Directory holding the configuration and the fleet spec.
    pub working_dir: PathBuf,
    /// Wall-clock limit for apply and destroy.
    pub timeout: Duration,
    /// Address of the per-server resource, indexed by server name.
    pub resource_address: String,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("terraform"),
            working_dir: PathBuf::from("."),
            timeout: Duration::from_secs(180),
            resource_address: "proxmox_vm_qemu.server".to_string(),
        }
    }
}

pub struct TerraformEngine {
    config: TerraformConfig,
    queue: Mutex<()>,
}

impl TerraformEngine {
    pub fn new(config: TerraformConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &TerraformConfig {
        &self.config
    }

    /// `-target=` arguments for the named servers.
    pub fn target_args(&self, targets: &[String]) -> Vec<String> {
        targets
            .iter()
            .map(|name| format!("-target={}[\"{}\"]", self.config.resource_address, name))
            .collect()
    }

    /// A lock artifact left by an earlier run, if any.
    pub fn stale_lock_artifact(&self) -> Option<PathBuf> {
        let path = self.config.working_dir.join(LOCK_ARTIFACT);
        path.exists().then_some(path)
    }

    /// Log a warning for a leftover lock artifact. The file is left in place.
    pub fn warn_on_stale_lock(&self) {
        if let Some(path) = self.stale_lock_artifact() {
            warn!(
                path = %path.display(),
                "found a provisioning lock artifact from an earlier run; \
                 verify no other process is converging, then remove it manually"
            );
        }
    }

    async fn run(&self, args: &[String], limit: Duration) -> Result<ConvergenceReport, ProvisionError> {
        let _turn = self.queue.lock().await;
        self.run_unqueued(args, limit).await
    }

    async fn run_unqueued(
        &self,
        args: &[String],
        limit: Duration,
    ) -> Result<ConvergenceReport, ProvisionError> {
        let binary = self.config.binary.display().to_string();
        let command = format!("{} {}", binary, args.join(" "));
        debug!(command = %command, dir = %self.config.working_dir.display(), "running provisioning tool");

        let child = Command::new(&self.config.binary)
            .args(args)
            .current_dir(&self.config.working_dir)
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProvisionError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        let output = match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ProvisionError::Spawn { binary, source })?,
            Err(_) => {
                warn!(command = %command, secs = limit.as_secs(), "provisioning tool timed out");
                return Err(ProvisionError::Timeout {
                    command,
                    secs: limit.as_secs(),
                });
            }
        };

        let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&stderr);
        }

        let success = output.status.success();
        info!(command = %command, success, exit_code = ?output.status.code(), "provisioning tool finished");
        Ok(ConvergenceReport { success, log })
    }

    fn converge_args(&self, verb: &str, targets: &[String]) -> Vec<String> {
        let mut args: Vec<String> = [verb, "-auto-approve", "-input=false", "-no-color", "-lock=false"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.extend(self.target_args(targets));
        args
    }

    pub fn working_dir(&self) -> &Path {
        &self.config.working_dir
    }
}

#[async_trait]
impl Provisioner for TerraformEngine {
    async fn init(&self) -> Result<ConvergenceReport, ProvisionError> {
        let args = ["init", "-input=false", "-no-color"].map(String::from);
        self.run(&args, self.config.timeout).await
    }

    #[instrument(skip_all, fields(servers = spec.servers.len(), live = live.len()))]
    async fn plan(
        &self,
        spec: &FleetSpec,
        live: &[HypervisorVm],
    ) -> Result<ConvergenceReport, ProvisionError> {
        let drifted = drift_guard(spec, live);
        if !drifted.is_empty() {
            warn!(servers = ?drifted, "plan refused: running machines would be recreated");
            return Ok(ConvergenceReport::failed(format!(
                "refusing to plan: running machines differ from the spec and would be recreated: {}",
                drifted.join(", ")
            )));
        }

        let args = ["plan", "-input=false", "-no-color", "-lock=false"].map(String::from);
        let report = self.run(&args, self.config.timeout).await?;
        if !report.success {
            return Ok(report);
        }

        let running: Vec<&str> = live
            .iter()
            .filter(|vm| vm.is_running())
            .map(|vm| vm.name.as_str())
            .collect();
        let replaced: Vec<String> = replaced_servers(&report.log, &self.config.resource_address)
            .into_iter()
            .filter(|name| running.contains(&name.as_str()))
            .collect();
        if !replaced.is_empty() {
            warn!(servers = ?replaced, "plan refused: running machines must be replaced");
            return Ok(ConvergenceReport::failed(format!(
                "refusing plan: running machines must be replaced: {}\n{}",
                replaced.join(", "),
                report.log
            )));
        }

        Ok(report)
    }

    #[instrument(skip(self))]
    async fn apply(&self, targets: &[String]) -> Result<ConvergenceReport, ProvisionError> {
        self.run(&self.converge_args("apply", targets), self.config.timeout)
            .await
    }

    #[instrument(skip(self))]
    async fn destroy(&self, targets: &[String]) -> Result<ConvergenceReport, ProvisionError> {
        self.run(&self.converge_args("destroy", targets), self.config.timeout)
            .await
    }

    async fn output(&self) -> Result<BTreeMap<String, serde_json::Value>, ProvisionError> {
        let args = ["output", "-json", "-no-color"].map(String::from);
        let report = self.run(&args, self.config.timeout).await?;
        if !report.success {
            return Err(ProvisionError::Output(report.log));
        }
        if report.log.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&report.log).map_err(|e| ProvisionError::Output(e.to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes a fake tool that records its arguments and behaves per `body`.
    fn fake_tool(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("terraform");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/calls.log\"\n{body}\n"
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn engine(dir: &TempDir, body: &str, timeout: Duration) -> TerraformEngine {
        TerraformEngine::new(TerraformConfig {
            binary: fake_tool(dir, body),
            working_dir: dir.path().to_path_buf(),
            timeout,
            ..Default::default()
        })
    }

    fn calls(dir: &TempDir) -> Vec<String> {
        std::fs::read_to_string(dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_apply_renders_targets_and_disables_tool_lock() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "echo applied", Duration::from_secs(10));

        let report = engine
            .apply(&["web-1".to_string(), "web-2".to_string()])
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(report.log.trim(), "applied");
        assert_eq!(
            calls(&dir),
            vec![
                "apply -auto-approve -input=false -no-color -lock=false \
                 -target=proxmox_vm_qemu.server[\"web-1\"] -target=proxmox_vm_qemu.server[\"web-2\"]"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_targets_converge_whole_fleet() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "true", Duration::from_secs(10));

        engine.destroy(&[]).await.unwrap();
        assert_eq!(
            calls(&dir),
            vec!["destroy -auto-approve -input=false -no-color -lock=false".to_string()]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_unsuccessful_with_combined_log() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            "echo 'planning'\necho 'Error: quota exceeded' >&2\nexit 1",
            Duration::from_secs(10),
        );

        let report = engine.apply(&["web-1".to_string()]).await.unwrap();
        assert!(!report.success);
        assert!(report.log.contains("planning"));
        assert!(report.log.contains("Error: quota exceeded"));
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "sleep 5", Duration::from_millis(200));

        let err = engine.apply(&["web-1".to_string()]).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let engine = TerraformEngine::new(TerraformConfig {
            binary: dir.path().join("does-not-exist"),
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        });

        assert!(matches!(
            engine.init().await.unwrap_err(),
            ProvisionError::Spawn { .. }
        ));
    }

    #[tokio::test]
    async fn test_plan_refuses_drift_without_running_tool() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, "true", Duration::from_secs(10));

        let mut spec = FleetSpec::default();
        spec.servers.insert(
            "web-1".to_string(),
            crate::fleet_spec::ServerSpec {
                cpu: 8,
                memory: 2048,
                ..Default::default()
            },
        );
        let live = vec![HypervisorVm {
            vmid: 101,
            name: "web-1".to_string(),
            status: "running".to_string(),
            node: "pve".to_string(),
            lock: None,
            cpus: Some(2),
            maxmem: Some(2048 * 1024 * 1024),
        }];

        let report = engine.plan(&spec, &live).await.unwrap();
        assert!(!report.success);
        assert!(report.log.contains("web-1"));
        assert!(calls(&dir).is_empty());
    }

    #[tokio::test]
    async fn test_plan_refuses_replacement_of_running_machine() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            "echo '  # proxmox_vm_qemu.server[\"web-1\"] must be replaced'",
            Duration::from_secs(10),
        );
        let live = vec![HypervisorVm {
            vmid: 101,
            name: "web-1".to_string(),
            status: "running".to_string(),
            node: "pve".to_string(),
            lock: None,
            cpus: None,
            maxmem: None,
        }];

        let report = engine.plan(&FleetSpec::default(), &live).await.unwrap();
        assert!(!report.success);
        assert!(report.log.contains("must be replaced"));
    }

    #[tokio::test]
    async fn test_output_and_vm_ids() {
        let dir = TempDir::new().unwrap();
        let engine = engine(
            &dir,
            r#"echo '{"vm_ids":{"sensitive":false,"type":["map","number"],"value":{"web-1":101,"db-1":"102"}}}'"#,
            Duration::from_secs(10),
        );

        let ids = engine.vm_ids().await.unwrap();
        assert_eq!(ids.get("web-1"), Some(&101));
        assert_eq!(ids.get("db-1"), Some(&102));
    }

    #[test]
    fn test_stale_lock_artifact_is_reported_not_removed() {
        let dir = TempDir::new().unwrap();
        let engine = TerraformEngine::new(TerraformConfig {
            working_dir: dir.path().to_path_buf(),
            ..Default::default()
        });
        assert!(engine.stale_lock_artifact().is_none());

        let lock = dir.path().join(LOCK_ARTIFACT);
        std::fs::write(&lock, "{}").unwrap();
        engine.warn_on_stale_lock();

        assert_eq!(engine.stale_lock_artifact(), Some(lock.clone()));
        assert!(lock.exists());
    }
}
