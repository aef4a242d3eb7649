//! Abacus file service
//!
//! Main entry point: loads configuration, connects the storage facade and
//! serves the HTTP API until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use abacus_api::{AppState, create_router};
use abacus_core::storage::{StorageConfig, StorageService};
use abacus_shared::{AppConfig, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config);

    let storage_config =
        StorageConfig::from_settings(&config.storage).context("invalid storage configuration")?;
    let shutdown = CancellationToken::new();
    let storage = StorageService::connect(storage_config, &shutdown)
        .await
        .context("failed to initialize storage")?;

    let state = AppState {
        storage: Arc::new(storage),
        shutdown: shutdown.clone(),
        max_upload_bytes: config.server.max_upload_bytes,
    };
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Server stopped");
    Ok(())
}

/// `RUST_LOG` wins over `logging.filter`.
fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let registry = tracing_subscriber::registry().with(filter);

    match config.logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Waits for Ctrl-C, then cancels every in-flight storage call.
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
