//! fleetctl - CLI for the vmfleet orchestrator.
//!
//! Mutating commands print the task id they were assigned; pass `--wait`
//! to follow the task until it finishes.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod config;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
