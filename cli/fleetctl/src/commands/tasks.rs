//! Task commands.

use std::time::Duration;

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::TaskView;
use crate::error::CliError;
use crate::output::{colored_status, print_output, print_progress, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct TasksCommand {
    #[command(subcommand)]
    command: TasksSubcommand,
}

#[derive(Debug, Subcommand)]
enum TasksSubcommand {
    /// List retained tasks, newest first.
    List,

    /// Show one task.
    Get(TaskIdArgs),

    /// Follow a task until it finishes.
    Wait(WaitTaskArgs),

    /// Ask a running or queued task to stop.
    Cancel(TaskIdArgs),
}

#[derive(Debug, Args)]
struct TaskIdArgs {
    task_id: String,
}

#[derive(Debug, Args)]
struct WaitTaskArgs {
    task_id: String,

    #[arg(long, default_value = "1800")]
    timeout: u64,
}

impl TasksCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            TasksSubcommand::List => list_tasks(ctx).await,
            TasksSubcommand::Get(args) => get_task(ctx, args).await,
            TasksSubcommand::Wait(args) => wait_task(ctx, args).await,
            TasksSubcommand::Cancel(args) => cancel_task(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct TaskRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "Type")]
    #[serde(rename = "type")]
    task_type: String,

    #[tabled(rename = "Status", display = "colored_status")]
    status: String,

    #[tabled(rename = "Message", display = "truncate")]
    message: String,

    #[tabled(rename = "Updated")]
    updated_at: String,
}

fn truncate(message: &str) -> String {
    const MAX: usize = 80;
    if message.chars().count() <= MAX {
        message.to_string()
    } else {
        let head: String = message.chars().take(MAX - 3).collect();
        format!("{head}...")
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ListTasksResponse {
    items: Vec<TaskRow>,
    total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct CancelResponse {
    task_id: String,
    cancelled: bool,
}

async fn list_tasks(ctx: CommandContext) -> Result<()> {
    let client = ctx.client()?;
    let response: ListTasksResponse = client.get("/v1/tasks").await?;

    match ctx.format {
        OutputFormat::Table => print_output(&response.items, ctx.format),
        OutputFormat::Json => print_single(&response, ctx.format),
    }
    Ok(())
}

async fn get_task(ctx: CommandContext, args: TaskIdArgs) -> Result<()> {
    let client = ctx.client()?;
    let task: TaskView = client
        .get(&format!("/v1/tasks/{}", args.task_id))
        .await
        .map_err(|e| match e {
            CliError::Api { status: 404, .. } => {
                CliError::NotFound(format!("Task '{}' not found", args.task_id))
            }
            other => other,
        })?;

    print_single(&task, ctx.format);
    Ok(())
}

async fn wait_task(ctx: CommandContext, args: WaitTaskArgs) -> Result<()> {
    let client = ctx.client()?;
    let format = ctx.format;
    let task = client
        .wait_for_task(&args.task_id, Duration::from_secs(args.timeout), |t| {
            if matches!(format, OutputFormat::Table) {
                print_progress(t);
            }
        })
        .await?;

    if matches!(format, OutputFormat::Json) {
        print_single(&task, format);
    }
    if task.status == "error" {
        return Err(CliError::TaskFailed {
            task_id: task.id,
            message: task.message,
        }
        .into());
    }
    if matches!(format, OutputFormat::Table) {
        print_success(&task.message);
    }
    Ok(())
}

async fn cancel_task(ctx: CommandContext, args: TaskIdArgs) -> Result<()> {
    let client = ctx.client()?;
    let response: CancelResponse = client
        .post(&format!("/v1/tasks/{}/cancel", args.task_id), &serde_json::json!({}))
        .await?;

    match ctx.format {
        OutputFormat::Json => print_single(&response, ctx.format),
        OutputFormat::Table if response.cancelled => {
            print_success(&format!("Cancellation requested for {}", response.task_id))
        }
        OutputFormat::Table => {
            println!("Task {} already finished; nothing to cancel", response.task_id)
        }
    }
    Ok(())
}
