use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use abd_core::collaborators::{FfmpegTranscoder, HttpLicenseClient, HttpMediaFetcher};
use abd_core::orchestration::Orchestrator;
use abd_core::task::{RemoteTaskStore, StoreService};
use abd_core::workflows::{downloader, encoder};
use abd_core::{
    load_config, validate_config, Downloader, Encoder, LocalBus, MessageBus, SqliteTaskStore,
    TaskStore,
};

use abd_worker::api::create_router;
use abd_worker::state::AppState;

/// Application version
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting abd-worker v{}", VERSION);

    // Determine config path
    let config_path = std::env::var("ABD_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));

    // Load configuration
    info!("Loading configuration from {:?}", config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    validate_config(&config).context("Invalid configuration")?;

    // Task store, served over the bus to the workers
    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::new(&config.store.path)
            .with_context(|| format!("Failed to open task store {:?}", config.store.path))?,
    );
    info!("Task store opened at {:?}", config.store.path);

    let bus = Arc::new(LocalBus::new());
    Arc::new(StoreService::new(Arc::clone(&store))).subscribe_all(&bus);
    let worker_bus: Arc<dyn MessageBus> = bus.clone();
    let worker_store: Arc<dyn TaskStore> =
        Arc::new(RemoteTaskStore::new(Arc::clone(&worker_bus)));

    // Downloader worker
    if config.downloader.enabled {
        let licenses = HttpLicenseClient::new(&config.downloader)
            .context("Failed to create license client")?;
        let fetcher =
            HttpMediaFetcher::new(&config.downloader).context("Failed to create media fetcher")?;
        let router = Downloader::new(Arc::new(licenses), Arc::new(fetcher)).router(
            &config.downloader,
            Arc::clone(&worker_store),
            Arc::clone(&worker_bus),
        );
        bus.subscribe(downloader::PROCESS_TOPIC, Arc::new(router));
        info!(
            "Downloader worker listening on {} (file concurrency {})",
            downloader::PROCESS_TOPIC,
            config.downloader.file_concurrency
        );
    } else {
        info!("Downloader worker disabled in config");
    }

    // Encoder worker
    if config.encoder.enabled {
        let transcoder = FfmpegTranscoder::new(config.encoder.clone());
        let router = Encoder::new(Arc::new(transcoder)).router(
            &config.encoder,
            Arc::clone(&worker_store),
            Arc::clone(&worker_bus),
        );
        bus.subscribe(encoder::PROCESS_TOPIC, Arc::new(router));
        info!(
            "Encoder worker listening on {} (remux concurrency {})",
            encoder::PROCESS_TOPIC,
            config.encoder.remux_concurrency
        );
    } else {
        info!("Encoder worker disabled in config");
    }

    // Re-emit parents that were waiting on children when the process stopped
    let recoveries = [
        (
            config.downloader.enabled,
            downloader::PROCESS_TOPIC,
            downloader::ORCHESTRATING_TOPICS,
        ),
        (
            config.encoder.enabled,
            encoder::PROCESS_TOPIC,
            encoder::ORCHESTRATING_TOPICS,
        ),
    ];
    for (enabled, process_topic, topics) in recoveries {
        if !enabled {
            continue;
        }
        let orchestrator = Orchestrator::new(
            Arc::clone(&worker_store),
            Arc::clone(&worker_bus),
            process_topic,
        );
        match orchestrator.recover(topics).await {
            Ok(0) => {}
            Ok(count) => info!("Recovered {} waiting tasks on {}", count, process_topic),
            Err(e) => warn!("Recovery on {} failed: {}", process_topic, e),
        }
    }

    // Admin API
    let state = Arc::new(AppState::new(config.clone(), store, worker_bus));
    let app = create_router(state);

    let addr = SocketAddr::new(config.admin.host, config.admin.port);
    info!("Starting admin API on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Let in-flight deliveries settle before the store closes
    bus.wait_idle().await;
    info!("Server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
