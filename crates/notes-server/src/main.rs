//! # Study Notes Server
//!
//! Live collaboration server for the Study Notes editor.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (documents kept in memory)
//! studynotes
//!
//! # Persist documents and listen on another port
//! NOTES__PORT=5000 NOTES__STORAGE__DATABASE_PATH=~/notes.db studynotes
//! ```

use anyhow::{Context, Result};
use std::sync::Arc;
use studynotes_core::{DocumentStore, MemoryStore, SqliteStore};
use studynotes_server::{config::Config, metrics, run_server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studynotes=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Study Notes server on {}:{}", config.host, config.port);

    let store: Arc<dyn DocumentStore> = match config.database_path() {
        Some(path) => Arc::new(
            SqliteStore::open(&path)
                .with_context(|| format!("Failed to open database {}", path.display()))?,
        ),
        None => {
            tracing::warn!("No storage.database_path set, documents are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    run_server(config, store).await?;

    Ok(())
}
