//! balance-tier server binary.
//!
//! Opens the file store, builds the ledger, starts the batch processor and
//! cache sweeper, and serves the HTTP API until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use balance_tier::clock::SystemClock;
use balance_tier::config::{Cli, Config};
use balance_tier::server::{build_router, AppState};
use balance_tier::store::FileStore;
use balance_tier::Ledger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "balance_tier=debug,tower_http=debug"
    } else {
        "balance_tier=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());

    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("balance-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?.with_cli(&cli);
    config.validate().context("invalid configuration")?;

    info!(
        hot = config.cache.hot.capacity,
        warm = config.cache.warm.capacity,
        cold = config.cache.cold.capacity,
        shards = config.cache.shards,
        "Cache tiers"
    );
    info!(
        batch_size = config.processor.batch_size,
        interval_ms = config.processor.interval_ms,
        max_outstanding = config.queue.max_outstanding,
        max_retries = config.queue.max_retries,
        "Queue settings"
    );

    // Open the durable store.
    let store = Arc::new(
        FileStore::open(&config.store)
            .await
            .with_context(|| format!("opening store in {}", config.store.data_dir.display()))?,
    );

    let listen_addr = config.server.listen.clone();
    let ledger = Arc::new(Ledger::new(config, store.clone(), Arc::new(SystemClock))?);

    // Background work.
    let cancel = CancellationToken::new();
    let tasks = ledger.spawn_background(cancel.clone());

    // Build the HTTP router.
    let state = Arc::new(AppState::new(ledger, cancel.clone()));
    let app = build_router(state);

    // Start the server.
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task panicked");
        }
    }

    store.compact().await.context("compacting store on shutdown")?;
    info!("Shutdown complete");
    Ok(())
}
