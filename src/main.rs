use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use lead_pipeline::app::context::AppContext;
use lead_pipeline::app::ports::QueueClient;
use lead_pipeline::config::{AppConfig, Backend};
use lead_pipeline::pipeline::processing::rekey_stored_leads;
use lead_pipeline::server::{start_server, ServerState};
use lead_pipeline::{logging, metrics};

#[derive(Parser)]
#[command(name = "lead_pipeline")]
#[command(about = "Lead ingestion gateway and processing workers")]
#[command(version)]
struct Cli {
    /// TOML configuration file (defaults to lead_pipeline.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP ingestion API together with the worker pool
    Serve {
        /// Accept leads only; another process runs the workers
        #[arg(long)]
        no_workers: bool,
    },
    /// Run the worker pool only
    Worker,
    /// Print dead-lettered messages as JSON
    DeadLetters,
    /// Re-wrap stored leads whose data keys are not on the current key version
    Rekey {
        #[arg(long, default_value_t = 100)]
        page_size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    logging::init_logging(&config.logging);
    metrics::init_metrics(&config.metrics);

    let ctx = AppContext::from_config(&config)?;

    match cli.command {
        Commands::Serve { no_workers } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let workers = if no_workers {
                Vec::new()
            } else {
                ctx.pool.clone().spawn(shutdown_rx)
            };

            let state = ServerState {
                gateway: ctx.gateway.clone(),
                queue: ctx.queue.clone(),
            };
            let served = start_server(state, &config.server.bind_addr, async {
                wait_for_ctrl_c().await;
            })
            .await;

            let _ = shutdown_tx.send(true);
            join_workers(workers).await;
            served?;
        }
        Commands::Worker => {
            if config.queue.backend == Backend::Memory {
                warn!("Worker started on an in-memory queue; it will only see its own process's leads");
            }
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let workers = ctx.pool.clone().spawn(shutdown_rx);
            wait_for_ctrl_c().await;
            let _ = shutdown_tx.send(true);
            join_workers(workers).await;
        }
        Commands::DeadLetters => {
            let letters = ctx.queue.dead_letters().await?;
            println!("{}", serde_json::to_string_pretty(&letters)?);
        }
        Commands::Rekey { page_size } => {
            let report = rekey_stored_leads(
                ctx.store.as_ref(),
                &ctx.crypto,
                &ctx.policies.storage,
                page_size,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Could not listen for shutdown signal");
        return;
    }
    info!("Shutdown requested, finishing in-flight batches");
}

async fn join_workers(workers: Vec<JoinHandle<()>>) {
    for handle in workers {
        if let Err(e) = handle.await {
            error!(error = %e, "Worker task failed");
        }
    }
}
