//! # Banking Gateway - Main Entry Point
//!
//! Loads configuration, installs logging and metrics, then serves until
//! SIGINT or SIGTERM. Health polling is stopped before the process exits.
//!
//! Configuration comes from `GATEWAY_CONFIG_PATH` (default
//! `config/gateway.yaml`). A missing file is not fatal: the gateway starts
//! with built-in defaults and `GATEWAY_*` overrides.

use std::path::Path;

use anyhow::Context;
use tokio::signal;
use tracing::{error, info, warn};

use banking_gateway::observability::{init_logging, prometheus_handle};
use banking_gateway::{GatewayConfig, GatewayServer};

const DEFAULT_CONFIG_PATH: &str = "config/gateway.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let (config, loaded_from_file) = load_config(&config_path).await?;

    init_logging(&config.logging);
    info!("🚀 Starting Banking Gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if loaded_from_file {
        info!("📋 Configuration loaded from {}", config_path);
    } else {
        warn!(
            "⚠️  No configuration file at {}, using built-in defaults",
            config_path
        );
    }

    // Install the recorder before any component emits metrics.
    prometheus_handle();

    if let Some(url) = &config.rate_limiting.redis_url {
        info!("📡 Shared rate limit store: {}", url);
    } else {
        info!("🧠 Rate limiting is process-local");
    }

    let server = GatewayServer::new(config).context("failed to build gateway")?;
    info!("🌐 Binding {}", server.bind_addr());

    if let Err(e) = server.run(shutdown_signal()).await {
        error!("🚨 Gateway terminated with error: {}", e);
        return Err(e.into());
    }

    info!("✅ Banking Gateway shutdown complete");
    Ok(())
}

async fn load_config(path: &str) -> anyhow::Result<(GatewayConfig, bool)> {
    if Path::new(path).exists() {
        let config = GatewayConfig::load_from_file(path)
            .await
            .with_context(|| format!("failed to load configuration from {}", path))?;
        return Ok((config, true));
    }

    let mut config = GatewayConfig::with_defaults();
    config
        .apply_env_overrides()
        .context("invalid GATEWAY_* environment override")?;
    config.validate().context("invalid default configuration")?;
    Ok((config, false))
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => info!("📡 Received SIGINT (Ctrl+C), initiating graceful shutdown..."),
        _ = terminate => info!("📡 Received SIGTERM, initiating graceful shutdown..."),
    }
}
