//! linkflow CLI: operate the link processing pipeline.
//!
//! Submits links, advances them through classification and routing, runs
//! the sweeper, and exposes the operator commands (inspect, requeue,
//! revive, reclassify, prune).

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
