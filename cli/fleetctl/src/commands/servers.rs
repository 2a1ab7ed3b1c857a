//! Server commands.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tabled::Tabled;

use crate::client::TaskAccepted;
use crate::error::CliError;
use crate::output::{colored_status, print_output, print_single, OutputFormat};

use super::{CommandContext, WaitArgs};

#[derive(Debug, Args)]
pub struct ServersCommand {
    #[command(subcommand)]
    command: ServersSubcommand,
}

#[derive(Debug, Subcommand)]
enum ServersSubcommand {
    /// List servers known to the metadata store.
    List,

    /// Show a server's record and declared spec.
    Get(NameArgs),

    /// Create a server.
    Create(CreateArgs),

    /// Create several servers from a JSON file.
    BulkCreate(BulkCreateArgs),

    /// Stop, destroy and forget a server.
    Delete(DeleteArgs),

    /// Delete several servers with one destroy.
    BulkDelete(NamesArgs),

    /// Power on servers.
    Start(NamesArgs),

    /// Power off servers.
    Stop(NamesArgs),

    /// Hard-reset servers.
    Reboot(NamesArgs),

    /// Assign a configuration role, or remove it with an empty `--role`.
    Role(RoleArgs),
}

#[derive(Debug, Args)]
struct NameArgs {
    name: String,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    name: String,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Debug, Args)]
struct NamesArgs {
    #[arg(required = true)]
    names: Vec<String>,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Debug, Args)]
struct CreateArgs {
    name: String,

    /// Read the server spec from a JSON file instead of flags.
    #[arg(long, short = 'f', conflicts_with_all = ["cpu", "memory", "disk"])]
    file: Option<PathBuf>,

    /// vCPU count.
    #[arg(long)]
    cpu: Option<u32>,

    /// Memory in MiB.
    #[arg(long)]
    memory: Option<u64>,

    /// Disk size in GiB; repeat for more disks.
    #[arg(long)]
    disk: Vec<u32>,

    /// Static address (`10.0.0.5/24` or `ip=10.0.0.5/24,gw=10.0.0.1`); dhcp if omitted.
    #[arg(long)]
    ip: Option<String>,

    #[arg(long)]
    bridge: Option<String>,

    #[arg(long)]
    os_type: Option<String>,

    #[arg(long)]
    template: Option<u32>,

    #[arg(long)]
    role: Option<String>,

    /// Role variable as KEY=VALUE; repeatable.
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Debug, Args)]
struct BulkCreateArgs {
    /// JSON file holding an array of server requests.
    #[arg(long, short = 'f')]
    file: PathBuf,

    #[command(flatten)]
    wait: WaitArgs,
}

#[derive(Debug, Args)]
struct RoleArgs {
    #[arg(required = true)]
    names: Vec<String>,

    /// Role name; an empty value removes the current role.
    #[arg(long, default_value = "")]
    role: String,

    /// Role variable as KEY=VALUE; repeatable.
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,

    #[command(flatten)]
    wait: WaitArgs,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

impl ServersCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ServersSubcommand::List => list_servers(ctx).await,
            ServersSubcommand::Get(args) => get_server(ctx, args).await,
            ServersSubcommand::Create(args) => create_server(ctx, args).await,
            ServersSubcommand::BulkCreate(args) => bulk_create(ctx, args).await,
            ServersSubcommand::Delete(args) => delete_server(ctx, args).await,
            ServersSubcommand::BulkDelete(args) => bulk_delete(ctx, args).await,
            ServersSubcommand::Start(args) => bulk_action(ctx, "start", args).await,
            ServersSubcommand::Stop(args) => bulk_action(ctx, "stop", args).await,
            ServersSubcommand::Reboot(args) => bulk_action(ctx, "reboot", args).await,
            ServersSubcommand::Role(args) => assign_role(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct ServerRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "VMID", display = "display_option_u32")]
    #[serde(default)]
    vmid: Option<u32>,

    #[tabled(rename = "Status", display = "colored_status")]
    status: String,

    #[tabled(rename = "IP", display = "display_option")]
    #[serde(default)]
    ip_address: Option<String>,

    #[tabled(rename = "Role", display = "display_option")]
    #[serde(default)]
    role: Option<String>,

    #[tabled(rename = "CPU")]
    cpu: u32,

    #[tabled(rename = "Memory (MiB)")]
    memory: u64,
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

fn display_option_u32(opt: &Option<u32>) -> String {
    opt.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Serialize, Deserialize)]
struct ListServersResponse {
    items: Vec<ServerRow>,
    total: usize,
}

async fn list_servers(ctx: CommandContext) -> Result<()> {
    let client = ctx.client()?;
    let response: ListServersResponse = client.get("/v1/servers").await?;

    match ctx.format {
        OutputFormat::Table => print_output(&response.items, ctx.format),
        OutputFormat::Json => print_single(&response, ctx.format),
    }
    Ok(())
}

async fn get_server(ctx: CommandContext, args: NameArgs) -> Result<()> {
    let client = ctx.client()?;
    let response: Value = client
        .get(&format!("/v1/servers/{}", args.name))
        .await
        .map_err(|e| match e {
            CliError::Api { status: 404, .. } => {
                CliError::NotFound(format!("Server '{}' not found", args.name))
            }
            other => other,
        })?;

    print_single(&response, ctx.format);
    Ok(())
}

/// Build the create request body from flags.
fn request_from_flags(args: &CreateArgs) -> Result<Value> {
    let (Some(cpu), Some(memory)) = (args.cpu, args.memory) else {
        bail!("--cpu and --memory are required unless --file is given");
    };
    if args.disk.is_empty() {
        bail!("at least one --disk is required unless --file is given");
    }

    let disks: Vec<Value> = args.disk.iter().map(|size| json!({ "size": size })).collect();
    let mut nic = serde_json::Map::new();
    nic.insert(
        "ip_address".to_string(),
        json!(args.ip.clone().unwrap_or_else(|| "dhcp".to_string())),
    );
    if let Some(bridge) = &args.bridge {
        nic.insert("bridge".to_string(), json!(bridge));
    }

    let mut body = json!({
        "name": args.name,
        "cpu": cpu,
        "memory": memory,
        "disks": disks,
        "network_devices": [Value::Object(nic)],
    });
    let fields = [
        ("os_type", args.os_type.clone().map(Value::from)),
        ("template_vm_id", args.template.map(Value::from)),
        ("role", args.role.clone().map(Value::from)),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            body[key] = value;
        }
    }
    if !args.vars.is_empty() {
        let vars: BTreeMap<&str, &str> = args
            .vars
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        body["role_vars"] = json!(vars);
    }
    Ok(body)
}

fn read_json(path: &PathBuf) -> Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}

async fn create_server(ctx: CommandContext, args: CreateArgs) -> Result<()> {
    let body = match &args.file {
        Some(path) => {
            let mut body = read_json(path)?;
            let Some(object) = body.as_object_mut() else {
                bail!("{:?} must contain a JSON object", path);
            };
            object.insert("name".to_string(), json!(args.name));
            body
        }
        None => request_from_flags(&args)?,
    };

    let client = ctx.client()?;
    let accepted: TaskAccepted = client.post("/v1/servers", &body).await?;
    ctx.follow(accepted, &args.wait).await
}

async fn bulk_create(ctx: CommandContext, args: BulkCreateArgs) -> Result<()> {
    let servers = read_json(&args.file)?;
    if !servers.is_array() {
        bail!("{:?} must contain a JSON array of servers", args.file);
    }

    let client = ctx.client()?;
    let accepted: TaskAccepted = client
        .post("/v1/servers/bulk", &json!({ "servers": servers }))
        .await?;
    ctx.follow(accepted, &args.wait).await
}

async fn delete_server(ctx: CommandContext, args: DeleteArgs) -> Result<()> {
    let client = ctx.client()?;
    let accepted: TaskAccepted = client.delete(&format!("/v1/servers/{}", args.name)).await?;
    ctx.follow(accepted, &args.wait).await
}

async fn bulk_delete(ctx: CommandContext, args: NamesArgs) -> Result<()> {
    let client = ctx.client()?;
    let accepted: TaskAccepted = client
        .post("/v1/servers/bulk-delete", &json!({ "names": args.names }))
        .await?;
    ctx.follow(accepted, &args.wait).await
}

async fn bulk_action(ctx: CommandContext, action: &str, args: NamesArgs) -> Result<()> {
    let client = ctx.client()?;
    let accepted: TaskAccepted = client
        .post(
            "/v1/servers/actions",
            &json!({ "action": action, "names": args.names }),
        )
        .await?;
    ctx.follow(accepted, &args.wait).await
}

async fn assign_role(ctx: CommandContext, args: RoleArgs) -> Result<()> {
    let vars: BTreeMap<String, String> = args.vars.into_iter().collect();
    let role = (!args.role.trim().is_empty()).then_some(args.role);

    let client = ctx.client()?;
    let accepted: TaskAccepted = match args.names.as_slice() {
        [name] => {
            client
                .put(
                    &format!("/v1/servers/{name}/role"),
                    &json!({ "role": role, "vars": vars }),
                )
                .await?
        }
        names => {
            client
                .post(
                    "/v1/servers/roles",
                    &json!({ "names": names, "role": role, "vars": vars }),
                )
                .await?
        }
    };
    ctx.follow(accepted, &args.wait).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(name: &str) -> CreateArgs {
        CreateArgs {
            name: name.to_string(),
            file: None,
            cpu: Some(2),
            memory: Some(4096),
            disk: vec![50],
            ip: None,
            bridge: None,
            os_type: Some("ubuntu".to_string()),
            template: None,
            role: None,
            vars: Vec::new(),
            wait: WaitArgs {
                wait: false,
                wait_timeout: 10,
            },
        }
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("port=8080").unwrap(),
            ("port".to_string(), "8080".to_string())
        );
        assert_eq!(
            parse_var("url=http://x?a=b").unwrap().1,
            "http://x?a=b".to_string()
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }

    #[test]
    fn test_request_from_flags() {
        let mut args = flags("web1");
        args.ip = Some("10.0.0.5/24".to_string());
        args.role = Some("nginx".to_string());
        args.vars = vec![("port".to_string(), "80".to_string())];

        let body = request_from_flags(&args).unwrap();
        assert_eq!(body["name"], "web1");
        assert_eq!(body["disks"][0]["size"], 50);
        assert_eq!(body["network_devices"][0]["ip_address"], "10.0.0.5/24");
        assert_eq!(body["role"], "nginx");
        assert_eq!(body["role_vars"]["port"], "80");
        assert!(body.get("template_vm_id").is_none());
    }

    #[test]
    fn test_request_requires_sizing() {
        let mut args = flags("web1");
        args.memory = None;
        assert!(request_from_flags(&args).is_err());

        let mut args = flags("web1");
        args.disk.clear();
        assert!(request_from_flags(&args).is_err());
    }
}
