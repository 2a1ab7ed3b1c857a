//! Proxmox VE REST client.
//!
//! Every trait call authenticates afresh: tickets are never cached across
//! workflows, so a long-lived orchestrator never acts on an expired session.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, instrument, warn};

use super::{Hypervisor, HypervisorError, HypervisorVm, Inventory, VmAction};

#[derive(Debug, Clone)]
pub struct ProxmoxConfig {
    /// Base API URL, e.g. `https://pve.example:8006/api2/json`.
    pub url: String,
    /// Login with realm, e.g. `root@pam`.
    pub username: String,
    pub password: String,
    pub verify_tls: bool,
    pub timeout: Duration,
}

impl Default for ProxmoxConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost:8006/api2/json".to_string(),
            username: "root@pam".to_string(),
            password: String::new(),
            verify_tls: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// An authenticated ticket.
#[derive(Debug, Clone)]
pub struct Session {
    pub ticket: String,
    pub csrf_token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct NodeItem {
    node: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct QemuItem {
    vmid: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    lock: Option<String>,
    #[serde(default)]
    cpus: Option<u32>,
    #[serde(default)]
    maxmem: Option<u64>,
    #[serde(default)]
    template: Option<u8>,
}

pub struct ProxmoxClient {
    client: reqwest::Client,
    config: ProxmoxConfig,
}

impl ProxmoxClient {
    pub fn new(config: ProxmoxConfig) -> Result<Self, HypervisorError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    #[instrument(skip(self), fields(user = %self.config.username))]
    pub async fn authenticate(&self) -> Result<Session, HypervisorError> {
        let response = self
            .client
            .post(self.url("/access/ticket"))
            .form(&[
                ("username", self.config.username.as_str()),
                ("password", self.config.password.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Proxmox login failed");
            return Err(HypervisorError::Auth(format!("{status}: {body}")));
        }

        let ticket: Envelope<Option<TicketData>> = response.json().await?;
        let data = ticket
            .data
            .ok_or_else(|| HypervisorError::Auth("login returned no ticket".to_string()))?;

        Ok(Session {
            ticket: data.ticket,
            csrf_token: data.csrf_token,
        })
    }

    fn request(&self, session: &Session, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method.clone(), self.url(path))
            .header("Cookie", format!("PVEAuthCookie={}", session.ticket));
        if method == Method::GET {
            builder
        } else {
            builder.header("CSRFPreventionToken", &session.csrf_token)
        }
    }

    async fn read<T: DeserializeOwned>(response: Response) -> Result<T, HypervisorError> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(HypervisorError::Api { status, body });
        }
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    async fn list_with(&self, session: &Session) -> Result<Inventory, HypervisorError> {
        let nodes: Vec<NodeItem> =
            Self::read(self.request(session, Method::GET, "/nodes").send().await?).await?;

        let mut inventory = Inventory::default();
        for node in nodes {
            if node.status.as_deref().is_some_and(|s| s != "online") {
                warn!(node = %node.node, status = ?node.status, "node not online; its VMs are unknown");
                inventory.unreachable.push(node.node);
                continue;
            }

            let path = format!("/nodes/{}/qemu", node.node);
            let items: Vec<QemuItem> = match self.request(session, Method::GET, &path).send().await {
                Ok(response) => match Self::read(response).await {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(node = %node.node, error = %e, "failed to list node VMs");
                        inventory.unreachable.push(node.node);
                        continue;
                    }
                },
                Err(e) => {
                    warn!(node = %node.node, error = %e, "failed to reach node");
                    inventory.unreachable.push(node.node);
                    continue;
                }
            };

            inventory.vms.extend(
                items
                    .into_iter()
                    .filter(|item| item.template.unwrap_or(0) == 0)
                    .map(|item| HypervisorVm {
                        vmid: item.vmid,
                        name: item.name.unwrap_or_default(),
                        status: item.status.unwrap_or_else(|| "unknown".to_string()),
                        node: node.node.clone(),
                        lock: item.lock.filter(|l| !l.is_empty()),
                        cpus: item.cpus,
                        maxmem: item.maxmem,
                    }),
            );
        }
        debug!(
            vms = inventory.vms.len(),
            unreachable = inventory.unreachable.len(),
            "listed cluster"
        );
        Ok(inventory)
    }

    async fn node_of(&self, session: &Session, vmid: u32) -> Result<String, HypervisorError> {
        self.list_with(session).await?.node_of(vmid)
    }
}

#[async_trait]
impl Hypervisor for ProxmoxClient {
    async fn inventory(&self) -> Result<Inventory, HypervisorError> {
        let session = self.authenticate().await?;
        self.list_with(&session).await
    }

    #[instrument(skip(self))]
    async fn vm_action(&self, vmid: u32, action: VmAction) -> Result<(), HypervisorError> {
        let session = self.authenticate().await?;
        let node = self.node_of(&session, vmid).await?;
        let path = format!("/nodes/{node}/qemu/{vmid}/status/{}", action.as_str());

        let response = self.request(&session, Method::POST, &path).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let reason = status.canonical_reason().unwrap_or_default();
            if body.to_ascii_lowercase().contains("lock") {
                warn!(vmid, body = %body, "VM action refused: locked");
                return Err(HypervisorError::Locked { vmid, detail: body });
            }
            error!(vmid, status = %status, body = %body, "VM action failed");
            return Err(HypervisorError::Api {
                status: status.as_u16(),
                body: if body.is_empty() { reason.to_string() } else { body },
            });
        }

        debug!(vmid, node = %node, "VM action accepted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unlock(&self, vmid: u32) -> Result<(), HypervisorError> {
        let session = self.authenticate().await?;
        let node = self.node_of(&session, vmid).await?;
        let path = format!("/nodes/{node}/qemu/{vmid}/config");

        let response = self
            .request(&session, Method::PUT, &path)
            .form(&[("delete", "lock")])
            .send()
            .await?;
        let _: Option<serde_json::Value> = Self::read(response).await?;

        warn!(vmid, "cleared VM lock");
        Ok(())
    }

    async fn is_lock_free(&self, vmid: u32) -> Result<bool, HypervisorError> {
        let session = self.authenticate().await?;
        let node = self.node_of(&session, vmid).await?;
        let path = format!("/nodes/{node}/qemu/{vmid}/config");

        let config: serde_json::Map<String, serde_json::Value> =
            Self::read(self.request(&session, Method::GET, &path).send().await?).await?;
        Ok(!config.contains_key("lock"))
    }
}
