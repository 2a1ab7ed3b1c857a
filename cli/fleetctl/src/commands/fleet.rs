//! Whole-fleet commands.

use anyhow::Result;
use clap::Args;

use crate::client::TaskAccepted;

use super::{CommandContext, WaitArgs};

#[derive(Debug, Args)]
pub struct ReconcileCommand {
    #[command(flatten)]
    wait: WaitArgs,
}

impl ReconcileCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let client = ctx.client()?;
        let accepted: TaskAccepted = client
            .post("/v1/fleet/reconcile", &serde_json::json!({}))
            .await?;
        ctx.follow(accepted, &self.wait).await
    }
}
