//! Pinfold hosting node binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use pinfold_core::config::AppConfig;
use pinfold_server::{AppState, Vaultr, create_router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Pinfold - a vault hosting and replication node
#[derive(Parser, Debug)]
#[command(name = "pinfoldd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "PINFOLD_CONFIG",
        default_value = "config/server.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Pinfold v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config(&args.config)?);

    pinfold_server::metrics::register_metrics();
    tracing::info!("Prometheus metrics registered");

    let storage = pinfold_storage::from_config(&config.storage)
        .await
        .context("failed to initialize vault storage")?;
    storage
        .health_check()
        .await
        .context("vault storage health check failed")?;
    tracing::info!(root = %storage.root().display(), "Vault storage ready");

    let metadata = pinfold_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("Metadata store initialized");

    let archives = pinfold_archive::from_config(&config.archive);
    let engine = Vaultr::new(config.clone(), metadata, storage, archives);

    let multiplexer = engine.start_multiplexer();

    let loader = engine.clone();
    tokio::spawn(async move {
        if let Err(e) = loader.load_all_vaults().await {
            tracing::error!(error = %e, "Startup vault load failed");
        }
    });

    let scheduler = if config.jobs.enabled {
        engine.spawn_scheduler()
    } else {
        tracing::info!("Background job scheduling disabled");
        Vec::new()
    };

    let app = create_router(AppState::new(engine.clone()));

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    tracing::info!("Shutting down");
    engine.shutdown();
    for handle in scheduler {
        let _ = handle.await;
    }
    let _ = multiplexer.await;
    engine.close_all().await;
    tracing::info!("All vaults closed");

    Ok(())
}

/// Load configuration from the optional TOML file, then `PINFOLD_*` env vars.
fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path);
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("PINFOLD_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
