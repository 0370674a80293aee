//! Embedding Ops
//!
//! Manual operations on the embeddings pipeline: full catalog resync,
//! replay of archived interactions, failed-operation triage, scheduled
//! retries and similarity cache control.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use core_config::Environment;
use core_config::tracing::{init_tracing, install_color_eyre};
use domain_embeddings::OperationStatus;
use eyre::{Result, WrapErr};
use tokio::io::BufReader;
use tracing::info;
use uuid::Uuid;

mod commands;
mod context;
mod replay;
mod schedule;

use commands::RetryOutput;
use context::OpsContext;
use replay::{ReplayWindow, Replayer};

#[derive(Parser)]
#[command(name = "embedding-ops")]
#[command(about = "Operate the embeddings pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Re-encode every catalog item
    Resync {
        /// Catalog items fetched per request
        #[arg(long, default_value_t = 100)]
        page_size: usize,

        /// Parallel encoder calls. Defaults to RESYNC_CONCURRENCY.
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Publish archived interactions (JSON lines) again
    Replay {
        /// Archive file
        #[arg(short, long)]
        file: String,

        /// Only events at or after this instant (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only events before this instant (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Parse and filter without publishing
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and retry failed catalog operations
    Failed {
        #[command(subcommand)]
        command: FailedCommands,
    },

    /// Run the retry coordinator
    Retry {
        #[command(subcommand)]
        command: RetryCommands,
    },

    /// Similarity cache control
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },
}

#[derive(Subcommand)]
enum FailedCommands {
    /// List operations, newest first
    List {
        /// failed, retrying, resolved or abandoned
        #[arg(short, long)]
        status: Option<OperationStatus>,

        #[arg(short, long, default_value_t = 50)]
        limit: u64,
    },

    /// Make an operation due immediately, including abandoned ones
    Retry {
        id: Uuid,

        /// Run a retry pass right away instead of waiting for the coordinator
        #[arg(long)]
        now: bool,
    },
}

#[derive(Subcommand)]
enum RetryCommands {
    /// Retry everything due now, once
    RunOnce,

    /// Retry on a cron schedule
    Schedule {
        /// Cron expression (default: every minute)
        #[arg(short, long, default_value = "0 * * * * *")]
        cron: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Drop every cached similarity result
    Clear,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    install_color_eyre();

    let environment = Environment::from_env();
    init_tracing(&environment);

    let cli = Cli::parse();
    let ctx = OpsContext::connect().await?;

    match cli.command {
        Commands::Resync {
            page_size,
            concurrency,
        } => {
            let concurrency = concurrency.unwrap_or(ctx.config.resync_concurrency);
            info!(page_size, concurrency, "Starting full catalog resync");

            let report = ctx
                .sync_service()?
                .resync_all(page_size, concurrency, |progress| {
                    info!(
                        total = progress.total,
                        synced = progress.synced,
                        failed = progress.failed,
                        "Resync progress"
                    );
                })
                .await?;
            println!(
                "Resync complete: {} items, {} synced, {} deferred to retry",
                report.total, report.synced, report.failed
            );
        }

        Commands::Replay {
            file,
            since,
            until,
            batch_size,
            dry_run,
        } => {
            let archive = tokio::fs::File::open(&file)
                .await
                .wrap_err_with(|| format!("Failed to open archive {}", file))?;
            let report = Replayer::new(ctx.publisher(), ReplayWindow { since, until })
                .with_batch_size(batch_size)
                .with_dry_run(dry_run)
                .replay(BufReader::new(archive))
                .await?;
            print_json(&report)?;
        }

        Commands::Failed { command } => match command {
            FailedCommands::List { status, limit } => {
                let operations = commands::list_failed(ctx.registry().as_ref(), status, limit).await?;
                print_json(&operations)?;
            }
            FailedCommands::Retry { id, now } => {
                let coordinator = if now { Some(ctx.coordinator()?) } else { None };
                match commands::retry_failed(
                    ctx.registry().as_ref(),
                    id,
                    Utc::now(),
                    coordinator.as_ref(),
                )
                .await?
                {
                    RetryOutput::Requeued(operation) => print_json(&operation)?,
                    RetryOutput::Retried(report) => print_json(&report)?,
                }
            }
        },

        Commands::Retry { command } => match command {
            RetryCommands::RunOnce => {
                let report = commands::run_retry_pass(&ctx.coordinator()?, Utc::now()).await?;
                print_json(&report)?;
            }
            RetryCommands::Schedule { cron } => {
                schedule::run_scheduled(ctx.coordinator()?, &cron).await?;
            }
        },

        Commands::Cache { command } => match command {
            CacheCommands::Clear => {
                let removed = commands::clear_cache(&ctx.engine()).await?;
                println!("Removed {} cached similarity results", removed);
            }
        },
    }

    Ok(())
}
