//! Crazed Fans - a transaction load generator for EVM chains
//!
//! A funding account recruits a crowd of ephemeral accounts ("fans") that
//! keep sending transactions on every new block and replace their own stuck
//! transactions with higher fees until they are mined.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod fans;
mod metrics;
mod president;
mod tx;

#[cfg(test)]
mod testing;

use chain::EthChain;
use config::{RunMode, Settings};
use metrics::MetricsServer;
use president::{President, PresidentConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Crazed Fans v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} fans ({}) on chain {}",
        settings.simulation.fan_count,
        settings.crazed_level(),
        settings.chain.chain_id
    );

    // Connect to the node
    let chain = Arc::new(EthChain::new(settings.chain.clone()).await?);
    info!("Chain connection initialized");

    let president = President::new(
        chain,
        settings.funding_signer()?,
        PresidentConfig::from_settings(&settings)?,
    )
    .await?;
    match president.funder().balance().await {
        Ok(balance) => info!(
            "Funding account {:?} holds {} ETH",
            president.funder().address(),
            ethers::utils::format_ether(balance)
        ),
        Err(e) => warn!("Could not read funding balance: {}", e),
    }

    // Start API server
    let api_handle = if settings.api.enabled {
        let config = settings.api.clone();
        let president = president.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, president).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Blocks must flow before funding can be confirmed
    president.watch().await;

    president.recruit(settings.simulation.fan_count).await?;
    president.fund_all(settings.initial_amount()?).await?;

    match settings.run_mode() {
        RunMode::Indefinite => president.activate().await,
        RunMode::Duration(duration) => president.activate_for_duration(duration).await,
        RunMode::Blocks(blocks) => president.activate_for_blocks(blocks).await?,
    }

    info!("Crazed Fans is running");
    if settings.api.enabled {
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    president.shutdown().await;

    // Abort background tasks
    if let Some(h) = api_handle {
        h.abort();
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Crazed Fans stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,crazed_fans=debug,hyper=warn"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
