use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use vmfleet_reconcile::PollConfig;

use crate::config_mgmt::AnsibleConfig;
use crate::db::DbConfig;
use crate::hypervisor::ProxmoxConfig;
use crate::lifecycle::LifecycleSettings;
use crate::provision::TerraformConfig;
use crate::tasks::TaskRegistryConfig;

/// Where server records and notifications live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataBackend {
    Postgres,
    Memory,
}

impl FromStr for MetadataBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown metadata backend '{other}' (expected postgres or memory)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    pub metadata_backend: MetadataBackend,
    pub database: DbConfig,
    pub spec_path: PathBuf,
    pub terraform: TerraformConfig,
    pub proxmox: ProxmoxConfig,
    pub ansible: AnsibleConfig,
    pub tasks: TaskRegistryConfig,
    pub lifecycle: LifecycleSettings,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|v| v.parse::<T>().with_context(|| format!("invalid {name}: '{v}'")))
        .transpose()
}

fn secs_var(name: &str) -> Result<Option<Duration>> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

fn flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = var("VMFLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid VMFLEET_LISTEN_ADDR")?;

        let log_level = var("VMFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let dev_mode = var("VMFLEET_DEV").map(|v| flag(&v)).unwrap_or(false);

        // Dev mode runs without Postgres unless told otherwise.
        let metadata_backend = match var("VMFLEET_METADATA_BACKEND") {
            Some(v) => v.parse()?,
            None if dev_mode => MetadataBackend::Memory,
            None => MetadataBackend::Postgres,
        };

        let mut terraform = TerraformConfig::default();
        if let Some(bin) = var("VMFLEET_TF_BIN") {
            terraform.binary = PathBuf::from(bin);
        }
        if let Some(dir) = var("VMFLEET_TF_DIR") {
            terraform.working_dir = PathBuf::from(dir);
        }
        if let Some(timeout) = secs_var("VMFLEET_TF_TIMEOUT_SECS")? {
            terraform.timeout = timeout;
        }
        if let Some(resource) = var("VMFLEET_TF_RESOURCE") {
            terraform.resource_address = resource;
        }

        let spec_path = var("VMFLEET_SPEC_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| terraform.working_dir.join("servers.json"));

        let mut proxmox = ProxmoxConfig::default();
        if let Some(url) = var("PROXMOX_URL") {
            proxmox.url = url;
        }
        if let Some(user) = var("PROXMOX_USER") {
            proxmox.username = user;
        }
        if let Some(password) = var("PROXMOX_PASSWORD") {
            proxmox.password = password;
        }
        if let Some(verify) = var("PROXMOX_VERIFY_TLS") {
            proxmox.verify_tls = flag(&verify);
        }

        let mut ansible = AnsibleConfig::default();
        if let Some(bin) = var("VMFLEET_ANSIBLE_BIN") {
            ansible.binary = PathBuf::from(bin);
        }
        if let Some(dir) = var("VMFLEET_PLAYBOOK_DIR") {
            ansible.playbook_dir = PathBuf::from(dir);
        }

        let mut tasks = TaskRegistryConfig::default();
        if let Some(capacity) = parse_var::<usize>("VMFLEET_MAX_TASKS")? {
            tasks.capacity = capacity.max(1);
        }
        if let Some(ttl) = secs_var("VMFLEET_TASK_TTL_SECS")? {
            tasks.ttl = ttl;
        }
        if let Some(timeout) = secs_var("VMFLEET_TASK_TIMEOUT_SECS")? {
            tasks.default_timeout = timeout;
        }

        let mut lifecycle = LifecycleSettings::default();
        if let Some(max) = parse_var::<usize>("VMFLEET_MAX_CONCURRENT_TASKS")? {
            lifecycle.max_concurrent_tasks = max.max(1);
        }
        if let Some(grace) = secs_var("VMFLEET_BULK_DELETE_GRACE_SECS")? {
            lifecycle.bulk_delete_grace = grace;
        }
        if let Some(window) = secs_var("VMFLEET_QUIESCE_TIMEOUT_SECS")? {
            lifecycle.quiesce = PollConfig::new(window, lifecycle.quiesce.interval);
        }

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            metadata_backend,
            database: DbConfig::from_env(),
            spec_path,
            terraform,
            proxmox,
            ansible,
            tasks,
            lifecycle,
        })
    }
}
