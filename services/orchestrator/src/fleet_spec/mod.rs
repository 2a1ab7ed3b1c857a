//! Declarative fleet specification (desired state).
//!
//! The fleet spec is a single JSON document consumed by the provisioning
//! tool: a `servers` map keyed by unique server name plus shared connection
//! fields. [`FleetSpecStore`] owns reads and writes of that document.

mod store;

pub use store::{FleetSpecStore, SpecStoreError, Versioned};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The whole declarative document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    /// Desired machines keyed by unique name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerSpec>,

    /// Hypervisor API endpoint used by the provisioning tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxmox_api_url: Option<String>,

    /// Hypervisor node new machines are placed on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<String>,

    /// Overrides the configured primary datastore for this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_datastore: Option<String>,

    /// Overrides the configured primary bridge for this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_bridge: Option<String>,

    /// Any other shared connection fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl FleetSpec {
    pub fn contains(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }
}

/// Desired configuration of one machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// vCPU count.
    #[serde(default)]
    pub cpu: u32,

    /// Memory in MiB.
    #[serde(default)]
    pub memory: u64,

    #[serde(default)]
    pub disks: Vec<DiskSpec>,

    #[serde(default)]
    pub network_devices: Vec<NetworkDevice>,

    /// Configuration-management role applied after provisioning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,

    /// Hypervisor template cloned for this machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_vm_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_group: Option<String>,
}

impl ServerSpec {
    /// Management address of the first network device, without a CIDR
    /// suffix. Accepts both `10.0.0.5/24` and `ip=10.0.0.5/24,gw=10.0.0.1`.
    pub fn primary_ip(&self) -> Option<String> {
        let raw = self.network_devices.first()?.ip_address.as_deref()?;
        let addr = raw
            .split(',')
            .find_map(|part| part.trim().strip_prefix("ip="))
            .unwrap_or(raw);
        let addr = addr.split('/').next().unwrap_or(addr).trim();
        if addr.is_empty() || addr.eq_ignore_ascii_case("dhcp") {
            None
        } else {
            Some(addr.to_string())
        }
    }

    /// Required-field check shared by single and bulk create.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.cpu == 0 {
            missing.push("cpu");
        }
        if self.memory == 0 {
            missing.push("memory");
        }
        if self.disks.is_empty() || self.disks.iter().any(|d| d.size == 0) {
            missing.push("disks");
        }
        if self.network_devices.is_empty() {
            missing.push("network_devices");
        }
        missing
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    /// Size in GiB.
    #[serde(default)]
    pub size: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datastore_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDevice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

/// Login pair injected into a machine when the request omits one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Defaults applied to every spec on upsert.
#[derive(Debug, Clone)]
pub struct SpecDefaults {
    /// Primary datastore for disks without one.
    pub datastore: String,

    /// Primary bridge for network devices without one.
    pub bridge: String,

    pub file_format: String,

    pub disk_type: String,

    /// OS type (lowercase) → credentials. The `default` key is the fallback.
    pub credentials: BTreeMap<String, Credentials>,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        let credentials = [
            ("ubuntu", Credentials::new("ubuntu", "ubuntu")),
            ("debian", Credentials::new("debian", "debian")),
            ("centos", Credentials::new("root", "changeme")),
            ("rocky", Credentials::new("root", "changeme")),
            ("windows", Credentials::new("Administrator", "changeme")),
            ("default", Credentials::new("admin", "changeme")),
        ]
        .into_iter()
        .map(|(os, creds)| (os.to_string(), creds))
        .collect();

        Self {
            datastore: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            file_format: "raw".to_string(),
            disk_type: "scsi".to_string(),
            credentials,
        }
    }
}

impl SpecDefaults {
    /// Credentials for an OS type. Matching is case-insensitive and by
    /// prefix, so `ubuntu22` resolves to the `ubuntu` entry.
    pub fn credentials_for(&self, os_type: Option<&str>) -> Option<&Credentials> {
        let os = os_type.map(str::to_ascii_lowercase).unwrap_or_default();
        self.credentials
            .iter()
            .filter(|(key, _)| key.as_str() != "default")
            .find(|(key, _)| !os.is_empty() && os.starts_with(key.as_str()))
            .map(|(_, creds)| creds)
            .or_else(|| self.credentials.get("default"))
    }

    /// Defaults with the document's own `default_*` fields layered on top.
    pub fn for_document(&self, doc: &FleetSpec) -> SpecDefaults {
        let mut effective = self.clone();
        if let Some(datastore) = &doc.default_datastore {
            effective.datastore = datastore.clone();
        }
        if let Some(bridge) = &doc.default_bridge {
            effective.bridge = bridge.clone();
        }
        effective
    }

    /// Fill unset fields. Fields the caller set are never overwritten.
    pub fn normalize(&self, spec: &mut ServerSpec) {
        for disk in &mut spec.disks {
            disk.datastore_id.get_or_insert_with(|| self.datastore.clone());
            disk.file_format.get_or_insert_with(|| self.file_format.clone());
            disk.disk_type.get_or_insert_with(|| self.disk_type.clone());
        }

        for nic in &mut spec.network_devices {
            nic.bridge.get_or_insert_with(|| self.bridge.clone());
        }

        if spec.vm_username.is_none() || spec.vm_password.is_none() {
            if let Some(creds) = self.credentials_for(spec.os_type.as_deref()).cloned() {
                spec.vm_username.get_or_insert(creds.username);
                spec.vm_password.get_or_insert(creds.password);
            }
        }

        if matches!(spec.role.as_deref(), Some(r) if r.trim().is_empty()) {
            spec.role = None;
        }
    }
}
