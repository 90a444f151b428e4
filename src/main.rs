//! FxSentry entry point
//!
//! Wires configuration, logging, the broker client and the trade engine,
//! then runs until SIGINT/SIGTERM and flushes state on the way out.

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fxsentry::broker::{Broker, OandaClient};
use fxsentry::config::AppConfig;
use fxsentry::engine::TradeEngine;
use fxsentry::journal::TradeJournal;
use fxsentry::state::StateStore;
use fxsentry::strategy::{FixedVolatility, PriceMomentumSource};

fn init_tracing(log_file: &str) -> Result<()> {
    if let Some(parent) = Path::new(log_file).parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log dir {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .init();
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configuration errors are the only failures allowed to kill the process.
    let config = AppConfig::load()?;
    config.validate_env()?;
    init_tracing(&config.chat.log_file)?;
    info!(config = %config.digest(), "Starting fxsentry");

    let api_token = std::env::var("OANDA_API_TOKEN")?;
    let account_id = std::env::var("OANDA_ACCOUNT_ID")?;
    let broker: Arc<dyn Broker> = Arc::new(OandaClient::new(
        config.broker.base_url(),
        &api_token,
        &account_id,
        config.broker.timeout_ms,
        config.broker.min_call_interval_ms,
    )?);

    let store = Arc::new(StateStore::open(
        &config.persistence.state_file,
        &config.persistence.backup_dir,
        config.persistence.backup_interval_secs,
        config.persistence.max_backups,
    )?);
    let journal = Arc::new(TradeJournal::open(&config.persistence.data_dir)?);
    let signal_source = Arc::new(PriceMomentumSource::new(Arc::clone(&broker)));
    let volatility = Arc::new(FixedVolatility::new(1.0));

    let engine = Arc::new(
        TradeEngine::new(config, store, broker, signal_source, volatility)
            .with_journal(journal),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run(shutdown_rx).await })
    };

    shutdown_signal().await?;
    warn!("Shutdown signal received, stopping gracefully");
    let _ = shutdown_tx.send(true);
    engine_task.await.context("Engine task panicked")?;
    info!("Stopped cleanly");
    Ok(())
}
