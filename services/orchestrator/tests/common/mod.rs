//! Scriptable fakes for the hypervisor, the provisioning tool and the
//! configuration-management runner, plus a harness wiring them into an
//! orchestrator backed by in-memory stores.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use vmfleet_id::TaskId;
use vmfleet_orchestrator::{
    config_mgmt::{ConfigMgmtError, RoleReport, RoleRunner, RoleTarget},
    db::{MemoryMetadataStore, MemoryNotificationStore, MetadataStore, NewServerRecord, ServerStatus},
    fleet_spec::{DiskSpec, FleetSpec, FleetSpecStore, NetworkDevice, ServerSpec, SpecDefaults},
    hypervisor::{Hypervisor, HypervisorError, HypervisorVm, Inventory, VmAction},
    lifecycle::{Components, CreateServer, LifecycleSettings, Orchestrator},
    notifications::NotificationStore,
    provision::{ConvergenceReport, ProvisionError, Provisioner},
    tasks::{Task, TaskRegistry, TaskRegistryConfig},
};
use vmfleet_reconcile::PollConfig;

// =============================================================================
// Hypervisor
// =============================================================================

#[derive(Default)]
struct HypervisorState {
    vms: BTreeMap<u32, HypervisorVm>,
    next_vmid: u32,
    /// Config lock held; `is_lock_free` reports false until unlocked.
    config_locked: HashSet<u32>,
    /// Stop is refused with a lock error until unlocked.
    refuse_stop: HashSet<u32>,
    /// Stop is accepted but the machine never powers off.
    stuck: HashSet<u32>,
    /// Actions fail with an API error.
    broken: HashSet<u32>,
    list_fails: bool,
    /// Nodes whose VMs are hidden from listings.
    offline_nodes: HashSet<String>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<HypervisorState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        let hv = Self::default();
        hv.state.lock().unwrap().next_vmid = 100;
        hv
    }

    /// Add a running VM and return its vmid.
    pub fn add_vm(&self, name: &str, cpus: u32, memory_mib: u64) -> u32 {
        let mut state = self.state.lock().unwrap();
        let vmid = state.next_vmid;
        state.next_vmid += 1;
        state.vms.insert(
            vmid,
            HypervisorVm {
                vmid,
                name: name.to_string(),
                status: "running".to_string(),
                node: "pve1".to_string(),
                lock: None,
                cpus: Some(cpus),
                maxmem: Some(memory_mib * 1024 * 1024),
            },
        );
        vmid
    }

    pub fn remove_by_name(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let before = state.vms.len();
        state.vms.retain(|_, vm| vm.name != name);
        state.vms.len() != before
    }

    pub fn vmid_of(&self, name: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .vms
            .values()
            .find(|vm| vm.name == name)
            .map(|vm| vm.vmid)
    }

    pub fn status_of(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .vms
            .values()
            .find(|vm| vm.name == name)
            .map(|vm| vm.status.clone())
    }

    pub fn has(&self, name: &str) -> bool {
        self.vmid_of(name).is_some()
    }

    pub fn lock_config(&self, vmid: u32) {
        self.state.lock().unwrap().config_locked.insert(vmid);
    }

    pub fn refuse_stop(&self, vmid: u32) {
        self.state.lock().unwrap().refuse_stop.insert(vmid);
    }

    pub fn make_stuck(&self, vmid: u32) {
        self.state.lock().unwrap().stuck.insert(vmid);
    }

    pub fn break_vm(&self, vmid: u32) {
        self.state.lock().unwrap().broken.insert(vmid);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().list_fails = fail;
    }

    /// Every VM added so far lives on `pve1`.
    pub fn set_node_offline(&self, node: &str, offline: bool) {
        let mut state = self.state.lock().unwrap();
        if offline {
            state.offline_nodes.insert(node.to_string());
        } else {
            state.offline_nodes.remove(node);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }
}

impl HypervisorState {
    fn visible(&self, vmid: u32) -> bool {
        self.vms
            .get(&vmid)
            .is_some_and(|vm| !self.offline_nodes.contains(&vm.node))
    }

    fn missing(&self, vmid: u32) -> HypervisorError {
        if self.offline_nodes.is_empty() {
            HypervisorError::VmNotFound(vmid)
        } else {
            HypervisorError::Incomplete {
                unreachable: self.offline_nodes.iter().cloned().collect(),
            }
        }
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn inventory(&self) -> Result<Inventory, HypervisorError> {
        let state = self.state.lock().unwrap();
        if state.list_fails {
            return Err(HypervisorError::Auth("ticket rejected".to_string()));
        }
        Ok(Inventory {
            vms: state
                .vms
                .values()
                .filter(|vm| !state.offline_nodes.contains(&vm.node))
                .cloned()
                .collect(),
            unreachable: state.offline_nodes.iter().cloned().collect(),
        })
    }

    async fn vm_action(&self, vmid: u32, action: VmAction) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{action:?}:{vmid}").to_lowercase());

        if state.broken.contains(&vmid) {
            return Err(HypervisorError::Api {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        if !state.visible(vmid) {
            return Err(state.missing(vmid));
        }
        if action == VmAction::Stop && state.refuse_stop.contains(&vmid) {
            return Err(HypervisorError::Locked {
                vmid,
                detail: "VM is locked (backup)".to_string(),
            });
        }
        let stuck = state.stuck.contains(&vmid);
        if let Some(vm) = state.vms.get_mut(&vmid) {
            match action {
                VmAction::Stop if !stuck => vm.status = "stopped".to_string(),
                VmAction::Stop => {}
                VmAction::Start | VmAction::Reset => vm.status = "running".to_string(),
            }
        }
        Ok(())
    }

    async fn unlock(&self, vmid: u32) -> Result<(), HypervisorError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("unlock:{vmid}"));
        state.refuse_stop.remove(&vmid);
        state.config_locked.remove(&vmid);
        Ok(())
    }

    async fn is_lock_free(&self, vmid: u32) -> Result<bool, HypervisorError> {
        let state = self.state.lock().unwrap();
        if !state.visible(vmid) {
            return Err(state.missing(vmid));
        }
        Ok(!state.config_locked.contains(&vmid))
    }
}

// =============================================================================
// Provisioner
// =============================================================================

#[derive(Default)]
struct ProvisionerState {
    fail_init: bool,
    fail_apply: bool,
    fail_destroy: bool,
    refuse_plan: bool,
    /// Apply succeeds but these machines never appear.
    phantom: HashSet<String>,
    apply_delay: Duration,
    outputs: BTreeMap<String, serde_json::Value>,
    calls: Vec<String>,
}

/// Converges the fake hypervisor toward the spec file, the way the real
/// tool converges the hypervisor toward its configuration.
pub struct FakeProvisioner {
    specs: Arc<FleetSpecStore>,
    hypervisor: Arc<FakeHypervisor>,
    state: Mutex<ProvisionerState>,
    running: tokio::sync::Mutex<()>,
}

impl FakeProvisioner {
    pub fn new(specs: Arc<FleetSpecStore>, hypervisor: Arc<FakeHypervisor>) -> Self {
        Self {
            specs,
            hypervisor,
            state: Mutex::new(ProvisionerState::default()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn fail_init(&self, fail: bool) {
        self.state.lock().unwrap().fail_init = fail;
    }

    pub fn fail_apply(&self, fail: bool) {
        self.state.lock().unwrap().fail_apply = fail;
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.state.lock().unwrap().fail_destroy = fail;
    }

    pub fn refuse_plan(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_plan = refuse;
    }

    pub fn never_create(&self, name: &str) {
        self.state.lock().unwrap().phantom.insert(name.to_string());
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        self.state.lock().unwrap().apply_delay = delay;
    }

    pub fn set_output(&self, name: &str, value: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .outputs
            .insert(name.to_string(), value);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn init(&self) -> Result<ConvergenceReport, ProvisionError> {
        self.record("init".to_string());
        if self.state.lock().unwrap().fail_init {
            return Ok(ConvergenceReport::failed("Error: backend unreachable"));
        }
        Ok(ConvergenceReport::ok("Terraform has been successfully initialized!"))
    }

    async fn plan(
        &self,
        _spec: &FleetSpec,
        _live: &[HypervisorVm],
    ) -> Result<ConvergenceReport, ProvisionError> {
        self.record("plan".to_string());
        if self.state.lock().unwrap().refuse_plan {
            return Ok(ConvergenceReport::failed("plan would replace running machines: db-1"));
        }
        Ok(ConvergenceReport::ok("No changes."))
    }

    async fn apply(&self, targets: &[String]) -> Result<ConvergenceReport, ProvisionError> {
        let _serialized = self.running.lock().await;
        self.record(format!("apply:{}", targets.join(",")));

        let (fail, delay, phantom) = {
            let state = self.state.lock().unwrap();
            (state.fail_apply, state.apply_delay, state.phantom.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Ok(ConvergenceReport::failed(
                "Error: 500 Internal Server Error creating VM",
            ));
        }

        let doc = self
            .specs
            .load()
            .await
            .map_err(|e| ProvisionError::Output(e.to_string()))?
            .doc;

        let mut names: Vec<String> = targets.to_vec();
        if names.is_empty() {
            names.extend(doc.servers.keys().cloned());
        }
        for name in names {
            match doc.servers.get(&name) {
                Some(spec) if !self.hypervisor.has(&name) && !phantom.contains(&name) => {
                    self.hypervisor.add_vm(&name, spec.cpu, spec.memory);
                }
                Some(_) => {}
                None => {
                    self.hypervisor.remove_by_name(&name);
                }
            }
        }
        Ok(ConvergenceReport::ok("Apply complete!"))
    }

    async fn destroy(&self, targets: &[String]) -> Result<ConvergenceReport, ProvisionError> {
        let _serialized = self.running.lock().await;
        self.record(format!("destroy:{}", targets.join(",")));
        if self.state.lock().unwrap().fail_destroy {
            return Ok(ConvergenceReport::failed("Error: timeout while waiting for unlock"));
        }
        for name in targets {
            self.hypervisor.remove_by_name(name);
        }
        Ok(ConvergenceReport::ok("Destroy complete!"))
    }

    async fn output(&self) -> Result<BTreeMap<String, serde_json::Value>, ProvisionError> {
        Ok(self.state.lock().unwrap().outputs.clone())
    }
}

// =============================================================================
// Role runner
// =============================================================================

#[derive(Default)]
pub struct FakeRoles {
    fail: Mutex<bool>,
    calls: Mutex<Vec<(Vec<String>, String, BTreeMap<String, String>)>>,
}

impl FakeRoles {
    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<(Vec<String>, String, BTreeMap<String, String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RoleRunner for FakeRoles {
    async fn assign_role(
        &self,
        targets: &[RoleTarget],
        role: &str,
        vars: &BTreeMap<String, String>,
    ) -> Result<RoleReport, ConfigMgmtError> {
        let names = targets.iter().map(|t| t.name.clone()).collect();
        self.calls
            .lock()
            .unwrap()
            .push((names, role.to_string(), vars.clone()));

        let success = !*self.fail.lock().unwrap();
        Ok(RoleReport {
            success,
            skipped: false,
            log: if success {
                "PLAY RECAP ok=3 changed=1 failed=0".to_string()
            } else {
                "TASK [install] fatal: UNREACHABLE!\nPLAY RECAP failed=1".to_string()
            },
        })
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub specs: Arc<FleetSpecStore>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub notifications: Arc<MemoryNotificationStore>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub provisioner: Arc<FakeProvisioner>,
    pub roles: Arc<FakeRoles>,
    pub tasks: Arc<TaskRegistry>,
    _dir: TempDir,
}

pub fn fast_settings() -> LifecycleSettings {
    LifecycleSettings {
        quiesce: PollConfig::new(Duration::from_millis(300), Duration::from_millis(10)),
        bulk_delete_grace: Duration::ZERO,
        max_concurrent_tasks: 4,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with(fast_settings(), TaskRegistryConfig::default())
    }

    pub fn with(settings: LifecycleSettings, task_config: TaskRegistryConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let specs = Arc::new(FleetSpecStore::new(
            dir.path().join("servers.json"),
            SpecDefaults::default(),
        ));
        let metadata = Arc::new(MemoryMetadataStore::new());
        let notifications = Arc::new(MemoryNotificationStore::new());
        let hypervisor = Arc::new(FakeHypervisor::new());
        let provisioner = Arc::new(FakeProvisioner::new(specs.clone(), hypervisor.clone()));
        let roles = Arc::new(FakeRoles::default());
        let tasks = Arc::new(TaskRegistry::new(task_config));

        let orchestrator = Orchestrator::new(
            Components {
                specs: specs.clone(),
                metadata: metadata.clone(),
                hypervisor: hypervisor.clone(),
                provisioner: provisioner.clone(),
                roles: roles.clone(),
                notifications: notifications.clone(),
                tasks: tasks.clone(),
            },
            settings,
        );

        Self {
            orchestrator,
            specs,
            metadata,
            notifications,
            hypervisor,
            provisioner,
            roles,
            tasks,
            _dir: dir,
        }
    }

    /// Poll a task until it reaches a terminal status.
    pub async fn wait(&self, id: TaskId) -> Task {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let task = self.tasks.get(&id).await.unwrap();
            if task.status.is_finished() {
                return task;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {id} did not finish: {task:?}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// A server that exists in all three places.
    pub async fn seed_server(&self, name: &str) -> u32 {
        let spec = server_spec(2, 2048);
        let vmid = self.hypervisor.add_vm(name, spec.cpu, spec.memory);
        self.specs.upsert(name, spec).await.unwrap();
        self.metadata
            .insert(NewServerRecord {
                name: name.to_string(),
                vmid: Some(vmid),
                status: ServerStatus::Running,
                ip_address: None,
                role: None,
                firewall_group: None,
                os_type: Some("ubuntu".to_string()),
                cpu: 2,
                memory: 2048,
            })
            .await
            .unwrap();
        vmid
    }

    pub async fn spec_names(&self) -> Vec<String> {
        self.specs.load().await.unwrap().doc.servers.into_keys().collect()
    }

    pub async fn record_names(&self) -> Vec<String> {
        self.metadata
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect()
    }

    pub async fn notification_log(&self) -> Vec<(String, String)> {
        self.notifications
            .recent(100)
            .await
            .unwrap()
            .into_iter()
            .map(|n| (n.severity.as_str().to_string(), n.message))
            .collect()
    }
}

pub fn server_spec(cpu: u32, memory: u64) -> ServerSpec {
    ServerSpec {
        cpu,
        memory,
        disks: vec![DiskSpec {
            size: 20,
            ..Default::default()
        }],
        network_devices: vec![NetworkDevice {
            bridge: None,
            ip_address: Some("ip=10.0.0.10/24,gw=10.0.0.1".to_string()),
        }],
        os_type: Some("ubuntu".to_string()),
        ..Default::default()
    }
}

pub fn create_request(name: &str) -> CreateServer {
    CreateServer {
        name: name.to_string(),
        spec: server_spec(2, 2048),
        role_vars: BTreeMap::new(),
    }
}

pub fn with_role(mut request: CreateServer, role: &str) -> CreateServer {
    request.spec.role = Some(role.to_string());
    request
}
