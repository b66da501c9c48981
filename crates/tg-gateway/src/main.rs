//! tunnelgate daemon
//!
//! Accepts browser WebSocket tunnels and relays them to remote-desktop
//! backend daemons.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tg_core::config::{self, GatewayConfig, LogLevel};
use tg_gateway::{registry, Gateway, GatewayServer, GuacdConnector};

#[derive(Parser)]
#[command(name = "tunnelgate")]
#[command(about = "Remote-desktop tunnel gateway with dynamic backend routing")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Default backend daemon host (overrides config)
    #[arg(long)]
    backend_host: Option<String>,

    /// Default backend daemon port (overrides config)
    #[arg(long)]
    backend_port: Option<u16>,

    /// Log level (quiet, errors, normal, verbose, debug; overrides config)
    #[arg(long, value_parser = parse_log_level)]
    log_level: Option<LogLevel>,
}

fn parse_log_level(value: &str) -> Result<LogLevel, String> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase()))
        .map_err(|_| format!("unknown log level {:?}", value))
}

fn load_config(args: &Args) -> Result<GatewayConfig> {
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path)
                .with_context(|| format!("Failed to load config from {:?}", default_path))?
        } else {
            GatewayConfig::default()
        }
    };

    if let Some(bind) = &args.bind {
        config.listen_address = bind.clone();
    }
    if let Some(host) = &args.backend_host {
        config.backend.host = host.clone();
    }
    if let Some(port) = args.backend_port {
        config.backend.port = port;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log.level.filter_directive().into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting tunnelgate with dynamic backend routing");
    tracing::info!("Default backend: {}", config.backend);
    if config.crypt.key.is_none() {
        tracing::warn!("No encryption key configured - tokens will not be decrypted");
    }

    let registry = registry::from_config(&config.registry)?;
    let tunnels = Arc::new(GuacdConnector::from_config(&config));
    let listen_address = config.listen_address.clone();

    let gateway = Arc::new(Gateway::new(config, registry, tunnels));
    let sweep = gateway.start();

    // Setup signal handlers
    let signal_gateway = Arc::clone(&gateway);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        signal_gateway.shutdown();
    });

    let result = GatewayServer::new(Arc::clone(&gateway)).run(&listen_address).await;

    // Stop the sweep even if the listener failed
    gateway.shutdown();
    let _ = sweep.await;

    result?;
    tracing::info!("tunnelgate shutdown complete");
    Ok(())
}
