//! CLI entry point for the agent runtime server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;

mod arbiter;
mod config;
mod cron;
mod error_taxonomy;
mod executor;
mod logging;
mod models;
mod runs;
mod runtime_api;
mod storage;
mod stream;
mod threads;

use crate::arbiter::ThreadLocks;
use crate::config::{Config, StorageBackend};
use crate::cron::CronScheduler;
use crate::executor::EchoExecutor;
use crate::runs::RunManager;
use crate::runtime_api::{RuntimeApiState, build_router, run_http_server};
use crate::threads::ThreadManager;

#[derive(Parser, Debug)]
#[command(
    name = "agent-runtime",
    author,
    version,
    about = "Self-hosted agent runtime: threads, runs, crons and SSE streaming"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Run the HTTP server (default)
    Serve(ServeArgs),
    /// Load and validate configuration, then print it
    CheckConfig,
}

#[derive(Args, Debug, Clone, Default)]
struct ServeArgs {
    /// Interface to bind
    #[arg(long)]
    host: Option<String>,
    /// Port to bind
    #[arg(long)]
    port: Option<u16>,
    /// Storage backend (memory or postgres)
    #[arg(long)]
    storage: Option<StorageBackend>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = Config::load(cli.config.clone())?;
    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::CheckConfig => {
            println!("{config:#?}");
            Ok(())
        }
        Commands::Serve(args) => {
            if let Some(host) = args.host {
                config.server.host = host;
            }
            if let Some(port) = args.port {
                config.server.port = port;
            }
            if let Some(backend) = args.storage {
                config.storage.backend = backend;
            }
            config.validate()?;
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let storage = storage::open_storage(&config.storage).await?;
    let locks = Arc::new(ThreadLocks::new());
    let threads = Arc::new(ThreadManager::new(storage.clone(), locks.clone()));
    let runs = RunManager::new(
        storage.clone(),
        threads.clone(),
        locks,
        Arc::new(EchoExecutor::default()),
        config.runs.clone(),
    );
    let crons = CronScheduler::new(
        storage.clone(),
        runs.clone(),
        threads.clone(),
        config.scheduler.clone(),
    );

    runs.recover().await?;
    crons.start().await?;

    let app = build_router(
        RuntimeApiState {
            threads,
            runs: runs.clone(),
            crons: crons.clone(),
        },
        &config.server.cors_origins,
    );
    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let addr = config.bind_addr();
        let shutdown = shutdown.clone();
        async move { run_http_server(&addr, app, shutdown).await }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            tracing::info!("shutdown requested");
        }
        result = &mut server => {
            // The server stopped on its own, most likely a bind failure.
            crons.shutdown().await;
            runs.shutdown().await;
            storage.close().await;
            return result?;
        }
    }

    shutdown.cancel();
    tokio::join!(crons.shutdown(), runs.shutdown());
    let served = server.await;
    storage.close().await;
    tracing::info!("runtime stopped");
    served?
}
