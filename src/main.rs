//! logo-proxy service entry point

use anyhow::{Context, Result};
use clap::Parser;
use logo_proxy::config::Config;
use logo_proxy::scheduler::RequestScheduler;
use logo_proxy::services::{AssetService, FailureTracker, HttpFetcher};
use logo_proxy::storage::{BlobStore, FsBlobStore, streaming::StreamingStorage};
use logo_proxy::utils::memory_monitor::MemoryMonitor;
use logo_proxy::web::{AppState, create_router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "logo-proxy", about = "Memory-aware logo and image cache service")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::load_from_file(&cli.config)?);
    info!(config_file = %cli.config, "configuration loaded");

    let store: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::new(config.storage.root.clone())
            .await
            .context("initializing blob store")?,
    );
    info!(root = %config.storage.root, "blob store ready");

    let storage = StreamingStorage::new(
        store.clone(),
        config.storage.streaming_threshold_bytes,
        config.storage.max_asset_bytes,
    );

    let monitor = MemoryMonitor::new(&config.memory);
    monitor.sample_now().await;

    let scheduler = RequestScheduler::new(config.scheduler.clone(), monitor.clone());

    let failures = Arc::new(FailureTracker::load(store.clone(), &config.failures).await);

    let fetcher = Arc::new(
        HttpFetcher::new(config.fetch.connect_timeout, &config.fetch.user_agent)
            .map_err(|e| anyhow::anyhow!("building http client: {e}"))?,
    );

    let service = AssetService::new(
        config.clone(),
        fetcher,
        storage,
        monitor.clone(),
        scheduler.clone(),
        failures.clone(),
    )?;
    info!("asset service ready");

    // Background loops stop together through one token.
    let cancel = CancellationToken::new();
    let monitor_task = monitor.start(cancel.clone());
    let scheduler_task = scheduler.start(cancel.clone());
    let service_task = service.start(cancel.clone());

    let state = AppState {
        service,
        monitor,
        scheduler,
    };
    let router = create_router(state);

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(address = %addr, "listening");

    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        })
        .await
        .context("serving http")?;

    cancel.cancel();
    let _ = monitor_task.await;
    let _ = scheduler_task.await;
    let _ = service_task.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
