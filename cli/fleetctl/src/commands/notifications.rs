//! Notification feed.

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::output::{colored_status, print_output, print_single, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct NotificationsCommand {
    /// Number of notifications to show (1-500).
    #[arg(long, default_value = "20")]
    limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Tabled)]
struct NotificationRow {
    #[tabled(rename = "When")]
    created_at: String,

    #[tabled(rename = "Severity", display = "colored_status")]
    severity: String,

    #[tabled(rename = "Title")]
    title: String,

    #[tabled(rename = "Message")]
    message: String,

    #[tabled(rename = "Task", display = "display_option")]
    #[serde(default)]
    task_id: Option<String>,
}

fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct ListNotificationsResponse {
    items: Vec<NotificationRow>,
}

impl NotificationsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let response: ListNotificationsResponse = client
            .get(&format!("/v1/notifications?limit={}", self.limit))
            .await?;

        match ctx.format {
            OutputFormat::Table => print_output(&response.items, ctx.format),
            OutputFormat::Json => print_single(&response, ctx.format),
        }
        Ok(())
    }
}
