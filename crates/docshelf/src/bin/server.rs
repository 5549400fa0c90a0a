//! docshelf server binary
//!
//! Run with: cargo run -p docshelf --bin docshelf-server -- serve

use clap::{Parser, Subcommand};
use docshelf::providers::{rebuild, MeilisearchMirror};
use docshelf::server::DocshelfServer;
use docshelf::storage::{ContentStore, DocumentRepository};
use docshelf::DocshelfConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "docshelf-server", version, about = "Content-addressed document store")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Push every live record into the search index
    Reindex,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docshelf=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = DocshelfConfig::load(cli.config.as_deref())?;

    tracing::info!("Configuration loaded");
    tracing::info!("  - Data directory: {}", config.storage.data_dir.display());
    tracing::info!("  - Search index: {} at {}", config.search.index, config.search.url);
    tracing::info!("  - Analysis retries: {}", config.analysis.max_retries);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let server = DocshelfServer::new(config).await?;
            tracing::info!("Listening on http://{}", server.address());
            server.start().await?;
        }
        Command::Reindex => reindex(&config).await?,
    }

    Ok(())
}

async fn reindex(config: &DocshelfConfig) -> anyhow::Result<()> {
    config.validate()?;
    let store = Arc::new(ContentStore::new(&config.storage.data_dir)?);
    let repository = DocumentRepository::new(store);
    let mirror = MeilisearchMirror::new(&config.search)?;
    mirror.ensure_index().await?;

    let count = rebuild(&repository, &mirror, config.processing.reindex_batch).await?;
    tracing::info!("Reindexed {} documents", count);
    Ok(())
}
