mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omnihub_channels::DefaultAdapterFactory;
use omnihub_core::{HttpAgentFactory, InstanceRegistry, MessageRouter, RouterConfig, TraceRecorder};
use omnihub_server::state::AppState;
use omnihub_store::ConfigStore;
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "omnihub", about = "Multi-tenant omnichannel messaging hub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub: connect active instances and serve the API.
    Serve,
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Re-detect message types for traces still marked unknown.
    BackfillTypes {
        #[arg(long, default_value_t = 1_000)]
        limit: u32,
    },
}

fn init_tracing() {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();
}

fn open_store(config: &Config) -> Result<ConfigStore> {
    if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    ConfigStore::open(&config.database_path)
        .with_context(|| format!("failed to open database at {}", config.database_path))
}

async fn serve(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let registry = Arc::new(InstanceRegistry::new(
        store.clone(),
        Arc::new(DefaultAdapterFactory),
    ));
    let router = MessageRouter::new(
        store.clone(),
        registry.clone(),
        Arc::new(HttpAgentFactory),
        RouterConfig::default(),
    );
    registry.set_handler(Arc::new(router.clone()));
    registry.connect_active().await;

    let state = AppState {
        store,
        registry: registry.clone(),
        router,
        api_key: config.api_key.clone(),
    };

    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            return;
        }
        tracing::info!("shutdown signal received, draining instances");
        registry.shutdown().await;
    };

    omnihub_server::serve(state, &config.cors, &config.bind_addr(), shutdown).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Migrate => {
            // Opening the store applies forward-only migrations.
            open_store(&config)?;
            println!("migrations applied: {}", config.database_path);
            Ok(())
        }
        Command::BackfillTypes { limit } => {
            let store = open_store(&config)?;
            let recorder = TraceRecorder::new(store);
            let migrated = recorder.backfill_unknown(limit).await?;
            println!("backfilled {migrated} trace(s)");
            Ok(())
        }
    }
}
