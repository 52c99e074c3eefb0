//! Binance Archiver Application
//!
//! Runs the rotating listeners for every market in the given JSON config
//! until interrupted.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use archiver_core::{ArchiverConfig, ArchiverDaemon, Observer, QueuedMessage, RunMode};

const CONFIG_ENV: &str = "ARCHIVER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.json";

/// Logs every message reaching the shared buffer in listener mode
struct TraceObserver;

impl Observer for TraceObserver {
    fn update(&self, message: &QueuedMessage) {
        tracing::debug!(
            "📨 {} {} @{}: {}",
            message.market,
            message.kind,
            message.received_at,
            message.payload
        );
    }
}

fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = config_path();
    let config = ArchiverConfig::from_json_file(&path).with_context(|| format!("loading config from {}", path))?;
    info!("🚀 Starting Binance archiver with config {}", path);
    for market in config.markets() {
        info!("📈 {}: {}", market, config.pairs(market).join(", "));
    }

    let daemon = ArchiverDaemon::new(config).context("building archiver")?;
    if daemon.config().run_mode == RunMode::Listener {
        daemon.add_observer(Arc::new(TraceObserver))?;
    }
    daemon.run()?;

    info!("📊 Archiver is running. Press Ctrl+C to stop.");
    signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    info!("🛑 Shutdown signal received...");

    daemon.shutdown().await;
    info!("✅ Binance archiver shutdown complete");

    Ok(())
}

