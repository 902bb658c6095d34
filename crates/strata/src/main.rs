//! Strata daemon - runs the consolidation scheduler over a configured memory system

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use strata::config::Config;
use strata::embedding::{EmbeddingPort, FastEmbedder};
use strata::error::{Result, StrataError};
use strata::system::{MemorySystem, TierIndexes};

/// Strata - tiered agent memory with background consolidation
#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Tiered agent memory with background consolidation")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the consolidation daemon (default command)
    #[command(name = "run")]
    Run,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Run) => daemon(cli.config).await,
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn daemon(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Strata daemon");

    let config = Config::load(config_path)?;
    tracing::debug!("Config loaded: {:?}", config);

    tracing::info!("Loading embedding model: {}", config.embedding.model);
    let embedder = Arc::new(FastEmbedder::new()?);
    if embedder.dimension() != config.embedding.dimension {
        return Err(StrataError::Config(format!(
            "embedding.dimension is {}, but {} produces {}",
            config.embedding.dimension,
            config.embedding.model,
            embedder.dimension()
        )));
    }

    let indexes = TierIndexes::from_config(&config, embedder.dimension()).await?;
    let system = MemorySystem::builder(config)
        .embedder(embedder)
        .indexes(indexes)
        .build()?;
    let restored = system.restore().await?;
    tracing::info!("Restored {restored} long-term items");

    let scheduler = system.scheduler().clone();
    scheduler.start().await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    scheduler.stop().await;
    let stuck = system.pipeline().stuck_items();
    if !stuck.is_empty() {
        tracing::warn!("{} items remain stuck in the consolidation queue", stuck.len());
    }
    Ok(())
}
