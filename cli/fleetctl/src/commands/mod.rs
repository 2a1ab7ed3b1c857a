//! CLI commands.

mod fleet;
mod notifications;
mod servers;
mod tasks;

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::client::{ApiClient, TaskAccepted};
use crate::config::Config;
use crate::error::CliError;
use crate::output::{print_info, print_progress, print_single, print_success, print_warning, OutputFormat};

/// vmfleet CLI - create, delete and operate fleet servers.
#[derive(Debug, Parser)]
#[command(name = "fleetctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Orchestrator API URL.
    #[arg(long, global = true, env = "VMFLEET_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage servers.
    Servers(servers::ServersCommand),

    /// Inspect and cancel background tasks.
    Tasks(tasks::TasksCommand),

    /// Show recent notifications.
    Notifications(notifications::NotificationsCommand),

    /// Converge the whole fleet to its declared spec.
    Reconcile(fleet::ReconcileCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let format = match self.format.as_str() {
            "json" => OutputFormat::Json,
            _ => OutputFormat::Table,
        };

        let mut config = Config::load()?;
        if let Some(url) = self.api_url {
            config.api_url = url;
        }

        let ctx = CommandContext { config, format };

        match self.command {
            Commands::Servers(cmd) => cmd.run(ctx).await,
            Commands::Tasks(cmd) => cmd.run(ctx).await,
            Commands::Notifications(cmd) => cmd.run(ctx).await,
            Commands::Reconcile(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("fleetctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Flags shared by every command that starts a task.
#[derive(Debug, Clone, Args)]
pub struct WaitArgs {
    /// Follow the task until it finishes.
    #[arg(long)]
    wait: bool,

    /// Give up waiting after this many seconds.
    #[arg(long, default_value = "1800")]
    wait_timeout: u64,
}

pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
}

impl CommandContext {
    pub fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.config)
    }

    /// Report an accepted task and optionally follow it to completion.
    pub async fn follow(&self, accepted: TaskAccepted, wait: &WaitArgs) -> Result<()> {
        if !wait.wait {
            match self.format {
                OutputFormat::Json => print_single(&accepted, self.format),
                OutputFormat::Table => {
                    print_info(&format!("Task {} accepted", accepted.task_id));
                    println!("  Follow with: fleetctl tasks wait {}", accepted.task_id);
                }
            }
            return Ok(());
        }

        let client = self.client()?;
        let format = self.format;
        let task = client
            .wait_for_task(&accepted.task_id, Duration::from_secs(wait.wait_timeout), |t| {
                if matches!(format, OutputFormat::Table) {
                    print_progress(t);
                }
            })
            .await?;

        if matches!(self.format, OutputFormat::Json) {
            print_single(&task, self.format);
        }

        if task.status == "error" {
            return Err(CliError::TaskFailed {
                task_id: task.id,
                message: task.message,
            }
            .into());
        }
        if task.message.contains("failed") {
            print_warning(&task.message);
        } else if matches!(self.format, OutputFormat::Table) {
            print_success(&task.message);
        }
        Ok(())
    }
}
