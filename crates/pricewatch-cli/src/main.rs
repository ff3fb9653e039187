use std::time::Instant;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "pricewatch")]
#[command(about = "Catalog price sync: fetch, diff, notify, commit")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one full sync pass (default).
    Run {
        /// Print the run summary as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    let json_logs = std::env::var("PRICEWATCH_LOG_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "pricewatch=info".into());

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run(json: bool) -> Result<()> {
    let summary = pricewatch_sync::run_once_from_env().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "sync complete: run_id={} unique={} new={} changed={} unchanged={} notified={} \
             skipped={} committed={} failed_commit_batches={}",
            summary.run_id,
            summary.unique_records,
            summary.new_records,
            summary.changed_records,
            summary.unchanged_records,
            summary.notified,
            summary.skipped,
            summary.committed,
            summary.failed_commit_batches
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let started = Instant::now();
    let outcome = match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => run(json).await,
        Commands::Migrate => pricewatch_sync::migrate_from_env()
            .await
            .map(|()| tracing::info!("migrations applied")),
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &outcome {
        Ok(()) => tracing::info!(elapsed_ms, "finished"),
        Err(err) => tracing::error!(elapsed_ms, error = %format!("{err:#}"), "aborted"),
    }
    outcome
}
