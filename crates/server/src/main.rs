//! Silo pool manager binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use silo_core::config::AppConfig;
use silo_server::{redirect_router, rivet_router, AppState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// silod - content-addressed deduplicating storage pool manager
#[derive(Parser, Debug)]
#[command(name = "silod")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "SILO_CONFIG", default_value = "config/silo.toml")]
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

    tracing::info!("silo v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %args.config, "Loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    } else {
        tracing::debug!("No config file found at {}", args.config);
    }
    let config: AppConfig = figment
        .merge(Env::prefixed("SILO_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Primary storage backend
    let backend = silo_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage")?;
    backend
        .health_check()
        .await
        .context("storage health check failed")?;
    tracing::info!(backend = backend.backend_name(), "Storage backend ready");

    // Dumps storage (always filesystem)
    let dumps_backend = silo_storage::from_config(&silo_core::config::StorageConfig::Filesystem {
        path: config.dumps.path.clone(),
    })
    .await
    .context("failed to initialize dumps storage")?;

    // Metadata store
    let metadata = silo_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    metadata
        .health_check()
        .await
        .context("metadata health check failed")?;
    tracing::info!("Metadata store ready");

    if config.users.is_empty() {
        tracing::warn!("No users configured; every authenticated request will be rejected");
    }
    if config.server.read_only {
        tracing::warn!("Starting in read-only maintenance mode");
    }

    // Optional backup replication sweep
    let backup_config = config.backup.clone();
    let state = AppState::new(config, backend, dumps_backend, metadata);

    if let Some(backup_config) = backup_config {
        let backup_backend = silo_storage::from_config(&backup_config.storage)
            .await
            .context("failed to initialize backup storage")?;
        let _backup_task = silo_server::backup::spawn_backup_task(
            state.backend.clone(),
            backup_backend,
            state.metadata.clone(),
            Duration::from_secs(backup_config.sweep_interval_secs),
        );
        tracing::info!(
            interval_secs = backup_config.sweep_interval_secs,
            "Backup sweep task spawned"
        );
    } else {
        tracing::info!("No backup backend configured");
    }

    // Redirect server
    let redirect_addr: SocketAddr = state
        .config
        .server
        .redirect_bind
        .parse()
        .context("invalid redirect bind address")?;
    let redirect_listener = tokio::net::TcpListener::bind(redirect_addr)
        .await
        .with_context(|| format!("failed to bind redirect server to {redirect_addr}"))?;
    tracing::info!("Redirect server listening on {redirect_addr}");
    let redirect_app = redirect_router(state.clone());
    let redirect_server = tokio::spawn(async move {
        axum::serve(redirect_listener, redirect_app).await
    });

    // Rivet server (optional)
    if state.config.rivet.enabled {
        let rivet_addr: SocketAddr = state
            .config
            .server
            .rivet_bind
            .parse()
            .context("invalid rivet bind address")?;
        let rivet_listener = tokio::net::TcpListener::bind(rivet_addr)
            .await
            .with_context(|| format!("failed to bind rivet server to {rivet_addr}"))?;
        tracing::info!("Rivet server listening on {rivet_addr}");
        let rivet_app = rivet_router(state.clone());
        let _rivet_server =
            tokio::spawn(async move { axum::serve(rivet_listener, rivet_app).await });
    } else {
        tracing::info!("Rivet server disabled");
    }

    redirect_server
        .await
        .context("redirect server task failed")?
        .context("redirect server exited")?;
    Ok(())
}
