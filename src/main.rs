//! blob-relay - streaming cache for content-addressed blobs

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blob_relay::{config::Args, server, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("blob_relay={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  blob-relay {}", env!("CARGO_PKG_VERSION"));
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Origin: {} ({:?} mode)", args.origin_url, args.origin_mode);
    info!(
        "Metadata: {}",
        args.metadata_url.as_deref().unwrap_or("none (extension fallback only)")
    );
    info!("Scratch dir: {}", args.scratch_dir.display());
    info!(
        "Cache: {} entries, ttl {}s, sweep every {}s",
        args.cache_max_entries, args.cache_ttl_secs, args.sweep_interval_secs
    );
    match args.fetch_timeout() {
        Some(timeout) => info!("Fetch timeout: {}s", timeout.as_secs()),
        None => info!("Fetch timeout: disabled"),
    }
    info!("======================================");

    let state = Arc::new(AppState::build(args).await?);
    server::run(state).await?;

    Ok(())
}
