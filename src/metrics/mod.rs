//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Queue depth and overflow
//! - Broadcast attempts, outcomes, and latency
//! - Provider calls and health
//! - Nonce accounting

use crate::error::{BroadcastError, BroadcastResult};
use crate::provider::health::HealthStatus;

use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Queue metrics
    pub static ref QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "broadcastd_queue_depth",
        "Current number of requests waiting for dispatch",
        &[]
    ).unwrap();

    pub static ref QUEUE_OVERFLOW: CounterVec = register_counter_vec!(
        "broadcastd_queue_overflow_total",
        "Total requests dropped or refused by the overflow policy",
        &["policy"]
    ).unwrap();

    // Broadcast metrics
    pub static ref BROADCAST_ATTEMPTS: CounterVec = register_counter_vec!(
        "broadcastd_broadcast_attempts_total",
        "Total broadcast attempts by strategy mode",
        &["chain_id", "mode"]
    ).unwrap();

    pub static ref BROADCAST_OUTCOMES: CounterVec = register_counter_vec!(
        "broadcastd_broadcast_outcomes_total",
        "Terminal broadcast outcomes by state",
        &["chain_id", "state"]
    ).unwrap();

    pub static ref STATE_TRANSITIONS: CounterVec = register_counter_vec!(
        "broadcastd_state_transitions_total",
        "Lifecycle state transitions",
        &["chain_id", "state"]
    ).unwrap();

    pub static ref BROADCAST_LATENCY: HistogramVec = register_histogram_vec!(
        "broadcastd_broadcast_latency_seconds",
        "Latency from dispatch to provider acceptance",
        &["chain_id"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref RETRIES: CounterVec = register_counter_vec!(
        "broadcastd_retries_total",
        "Total retry attempts scheduled",
        &["chain_id"]
    ).unwrap();

    // Provider metrics
    pub static ref PROVIDER_CALLS: CounterVec = register_counter_vec!(
        "broadcastd_provider_calls_total",
        "Total RPC calls by provider and outcome",
        &["provider_id", "outcome"]
    ).unwrap();

    pub static ref PROVIDER_LATENCY: HistogramVec = register_histogram_vec!(
        "broadcastd_provider_latency_seconds",
        "RPC call latency per provider",
        &["provider_id"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    pub static ref PROVIDER_HEALTH: GaugeVec = register_gauge_vec!(
        "broadcastd_provider_health",
        "Provider health (2=healthy, 1=degraded, 0=failed, -1=unknown)",
        &["provider_id"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "broadcastd_chain_block_height",
        "Latest block height observed per chain",
        &["chain_id"]
    ).unwrap();

    // Nonce metrics
    pub static ref NONCES_IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "broadcastd_nonces_in_flight",
        "Nonces leased but not yet completed, per chain",
        &["chain_id"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BroadcastResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| BroadcastError::Internal(format!("metrics bind failed: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| BroadcastError::Internal(format!("metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_queue_depth(depth: usize) {
    QUEUE_DEPTH.with_label_values(&[]).set(depth as f64);
}

pub fn record_queue_overflow(policy: &str) {
    QUEUE_OVERFLOW.with_label_values(&[policy]).inc();
}

pub fn record_broadcast_attempt(chain_id: u64, mode: &str) {
    BROADCAST_ATTEMPTS
        .with_label_values(&[&chain_id.to_string(), mode])
        .inc();
}

pub fn record_broadcast_outcome(chain_id: u64, state: &str) {
    BROADCAST_OUTCOMES
        .with_label_values(&[&chain_id.to_string(), state])
        .inc();
}

pub fn record_state_transition(chain_id: u64, state: &str) {
    STATE_TRANSITIONS
        .with_label_values(&[&chain_id.to_string(), state])
        .inc();
}

pub fn record_broadcast_latency(chain_id: u64, latency_secs: f64) {
    BROADCAST_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_retry(chain_id: u64) {
    RETRIES.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_provider_call(provider_id: &str, success: bool, latency_secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    PROVIDER_CALLS
        .with_label_values(&[provider_id, outcome])
        .inc();
    PROVIDER_LATENCY
        .with_label_values(&[provider_id])
        .observe(latency_secs);
}

pub fn record_provider_health(provider_id: &str, status: HealthStatus) {
    let value = match status {
        HealthStatus::Healthy => 2.0,
        HealthStatus::Degraded => 1.0,
        HealthStatus::Failed => 0.0,
        HealthStatus::Unknown => -1.0,
    };
    PROVIDER_HEALTH.with_label_values(&[provider_id]).set(value);
}

pub fn record_chain_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_nonce_in_flight(chain_id: u64, count: usize) {
    NONCES_IN_FLIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(count as f64);
}
