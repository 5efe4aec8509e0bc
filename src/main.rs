//! broadcastd - Transaction broadcast orchestration daemon
//!
//! Accepts signed-transaction requests over HTTP, queues them, and pushes
//! them onto configured networks through health-ranked RPC providers using
//! configurable coordination strategies, then monitors confirmations.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod api;
mod broadcast;
mod config;
mod error;
mod events;
mod metrics;
mod provider;
mod queue;
#[cfg(test)]
mod testing;
mod tx;

use broadcast::BroadcastService;
use config::Settings;
use events::EventBus;
use metrics::MetricsServer;
use provider::LocalSigner;

const DEFAULT_KEY_ENV: &str = "BROADCASTD_PRIVATE_KEY";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting broadcastd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} networks",
        settings.enabled_networks().len()
    );

    // Shared event bus
    let events = EventBus::default();

    // Provider registry with every enabled network's endpoints
    let registry = provider::build_registry(&settings, events.clone())?;
    info!("Provider registry initialized");

    // Signing key
    let key_env = settings
        .wallet
        .private_key_env
        .clone()
        .unwrap_or_else(|| DEFAULT_KEY_ENV.to_string());
    let signer = Arc::new(LocalSigner::from_env(&key_env)?);

    // Broadcast service and confirmation monitor
    let networks: HashMap<u64, config::NetworkProfile> = settings
        .enabled_networks()
        .into_iter()
        .map(|(_, n)| (n.chain_id, n.clone()))
        .collect();
    let (service, monitor, retry_rx) = BroadcastService::build(
        &settings.broadcaster,
        networks,
        registry.clone(),
        signer,
        events.clone(),
    );
    info!("Broadcast service initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let api_config = settings.api.clone();
        let service = service.clone();
        async move {
            if let Err(e) = api::run_server(api_config, service).await {
                error!("API server error: {}", e);
            }
        }
    });

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

    // Start provider health probes
    let probe_handle = tokio::spawn(provider::run_probe_loop(
        registry.clone(),
        settings.broadcaster.probe_interval_secs,
    ));

    // Start the confirmation monitor
    let monitor_handle = tokio::spawn(async move { monitor.run().await });

    // Start the dispatcher and the retry consumer
    let dispatch_handle = tokio::spawn(service.clone().run_dispatcher());
    let retry_handle = tokio::spawn(service.clone().run_retries(retry_rx));

    info!("broadcastd is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Abort background tasks
    api_handle.abort();
    probe_handle.abort();
    monitor_handle.abort();
    dispatch_handle.abort();
    retry_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("broadcastd stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,broadcastd=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
