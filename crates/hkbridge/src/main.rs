//! hkbridge
//!
//! Exposes MQTT devices as HomeKit accessories, as described by a TOML file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use hkbridge::accessory::LogTransport;
use hkbridge::bridge::Bridge;
use hkbridge::bus::MqttBus;
use hkbridge::config::BridgeConfig;

/// MQTT to HomeKit bridge
#[derive(Parser, Debug)]
#[command(name = "hkbridge")]
#[command(about = "Bridges MQTT devices to HomeKit", long_about = None)]
struct Args {
    /// Path to the bridge configuration file
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hkbridge=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let Some(path) = args.config else {
        Args::command().print_help()?;
        println!();
        return Ok(());
    };

    info!("Starting hkbridge v{}", env!("CARGO_PKG_VERSION"));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;
    let result = runtime.block_on(run(path));

    // Snippets stuck in a blocking call must not hold the process open
    runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

async fn run(path: PathBuf) -> Result<()> {
    let config = BridgeConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let bus = Arc::new(MqttBus::new(&config.mqtt)?);
    let transport = Arc::new(LogTransport::new());
    let bridge = Bridge::new(&config, bus, transport)?;

    if let Err(e) = bridge.start().await {
        error!("Startup failed: {}", e);
        bridge.shutdown().await.ok();
        return Err(e.into());
    }

    shutdown_signal().await;

    bridge.shutdown().await?;
    info!("Bridge shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
