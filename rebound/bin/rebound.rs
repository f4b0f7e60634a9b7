#![deny(clippy::pedantic, clippy::all, clippy::nursery)]
#![allow(clippy::must_use_candidate)]

#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rebound::{Rebound, controller::find_config_file};
use rebound_common::JobKind;
use rebound_store::JobStore;

/// Broker-side redelivery and dead-letter handling
#[derive(Parser, Debug)]
#[command(name = "rebound")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "REBOUND_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker (default)
    Serve,
    /// List the jobs persisted in the configured store
    Jobs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = find_config_file(cli.config.as_deref())?;
    let rebound = Rebound::from_file(&config_path)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => rebound.run().await,
        Command::Jobs => list_jobs(rebound).await,
    }
}

async fn list_jobs(rebound: Rebound) -> anyhow::Result<()> {
    let store = rebound.store.open()?;
    let jobs = store.scan_all().await?;

    if jobs.is_empty() {
        println!("No pending jobs");
        return Ok(());
    }

    println!(
        "{:<32} {:<12} {:<32} {:>8} {:>16}",
        "JOB", "KIND", "TARGET", "ATTEMPT", "FIRE AT (ms)"
    );

    for job in jobs {
        let kind = match job.kind {
            JobKind::Redelivery => "redelivery",
            JobKind::DeadLetter { .. } => "dead-letter",
        };
        println!(
            "{:<32} {:<12} {:<32} {:>8} {:>16}",
            job.id.to_string(),
            kind,
            job.target.to_string(),
            job.attempt,
            job.fire_at_ms
        );
    }

    Ok(())
}
