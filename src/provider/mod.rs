//! Provider module - RPC capability traits, health tracking, rate limiting
//!
//! This module provides:
//! - The `RpcEndpoint` / `TxSigner` capability traits plus ethers adapters
//! - Per-provider health state machines with reliability-ordered selection
//! - Token-bucket rate limiting per provider
//! - A periodic probe loop feeding the same health paths as live traffic

pub mod endpoint;
pub mod health;
pub mod rate_limit;

pub use endpoint::{FeeData, HttpEndpoint, LocalSigner, RpcEndpoint, RpcError, RpcResult, TxSigner};
pub use health::{HealthSnapshot, HealthStatus, HealthThresholds, ProviderHandle, ProviderHealthRegistry};
pub use rate_limit::RateLimiter;

use crate::config::Settings;
use crate::error::BroadcastResult;
use crate::events::EventBus;

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Build a registry with every enabled network's providers registered
pub fn build_registry(settings: &Settings, events: EventBus) -> BroadcastResult<Arc<ProviderHealthRegistry>> {
    let thresholds = HealthThresholds {
        failure_threshold: settings.broadcaster.failure_threshold,
        recovery_threshold: settings.broadcaster.recovery_threshold,
    };
    let registry = Arc::new(ProviderHealthRegistry::new(thresholds, events));

    for (name, network) in settings.enabled_networks() {
        for provider in &network.providers {
            let endpoint = Arc::new(HttpEndpoint::new(&provider.url)?);
            let limiter = RateLimiter::new(
                settings.broadcaster.rate_limit_per_sec,
                settings.broadcaster.rate_limit_burst,
            );
            registry.register(
                &provider.id,
                network.chain_id,
                provider.weight,
                provider.tier,
                endpoint,
                limiter,
            );
        }
        info!(
            network = name.as_str(),
            chain_id = network.chain_id,
            providers = network.providers.len(),
            "network registered"
        );
    }

    Ok(registry)
}

/// Periodic health-probe loop; runs until the task is aborted
pub async fn run_probe_loop(registry: Arc<ProviderHealthRegistry>, interval_secs: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        ticker.tick().await;
        registry.probe_all().await;
    }
}
