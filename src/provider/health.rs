//! Provider health registry
//!
//! Every RPC outcome — live traffic and probes alike — flows through
//! `record_success`/`record_failure`, which drive a per-provider health state
//! machine and the rolling metrics used for reliability-ordered selection.

use crate::error::{BroadcastError, BroadcastResult};
use crate::events::{BroadcastEvent, EventBus};
use crate::provider::endpoint::RpcEndpoint;
use crate::provider::rate_limit::RateLimiter;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Provider health classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Failed,
}

/// Thresholds driving the health state machine
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Consecutive failures before a provider is excluded
    pub failure_threshold: u32,
    /// Consecutive successes a failed provider needs to return to service
    pub recovery_threshold: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// EWMA smoothing factors for the rolling metrics
const LATENCY_ALPHA: f64 = 0.2;
const SUCCESS_ALPHA: f64 = 0.1;

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    /// EWMA of success (1.0) / failure (0.0) outcomes
    success_rate: f64,
    /// EWMA latency of successful calls
    latency_ms: f64,
    total_successes: u64,
    total_failures: u64,
    last_error: Option<String>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_successes: 0,
            consecutive_failures: 0,
            success_rate: 1.0,
            latency_ms: 0.0,
            total_successes: 0,
            total_failures: 0,
            last_error: None,
        }
    }
}

/// One registered provider: endpoint handle, its throttle, and health state
pub struct ProviderHandle {
    pub id: String,
    pub chain_id: u64,
    pub weight: u32,
    pub tier: u8,
    pub endpoint: Arc<dyn RpcEndpoint>,
    pub limiter: RateLimiter,
    state: Mutex<HealthState>,
}

// Manual impl: the endpoint trait object has no Debug
impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("chain_id", &self.chain_id)
            .field("weight", &self.weight)
            .field("tier", &self.tier)
            .finish_non_exhaustive()
    }
}

impl ProviderHandle {
    pub fn status(&self) -> HealthStatus {
        self.state.lock().unwrap().status
    }

    /// Failed providers are excluded from selection; everything else is fair game
    pub fn is_selectable(&self) -> bool {
        self.status() != HealthStatus::Failed
    }
}

/// Read-only snapshot for the API and selection ranking
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub id: String,
    pub chain_id: u64,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub latency_ms: f64,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

/// Registry of all providers across networks
pub struct ProviderHealthRegistry {
    providers: DashMap<String, Arc<ProviderHandle>>,
    thresholds: HealthThresholds,
    /// Per-attempt timeout for health probes
    probe_timeout: Duration,
    events: EventBus,
}

impl ProviderHealthRegistry {
    pub fn new(thresholds: HealthThresholds, events: EventBus) -> Self {
        Self {
            providers: DashMap::new(),
            thresholds,
            probe_timeout: Duration::from_secs(10),
            events,
        }
    }

    pub fn register(
        &self,
        id: &str,
        chain_id: u64,
        weight: u32,
        tier: u8,
        endpoint: Arc<dyn RpcEndpoint>,
        limiter: RateLimiter,
    ) {
        let handle = Arc::new(ProviderHandle {
            id: id.to_string(),
            chain_id,
            weight,
            tier,
            endpoint,
            limiter,
            state: Mutex::new(HealthState::new()),
        });
        self.providers.insert(id.to_string(), handle);
        debug!(provider = id, chain_id, "provider registered");
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProviderHandle>> {
        self.providers.get(id).map(|p| p.clone())
    }

    /// Record a successful call and its latency
    pub fn record_success(&self, id: &str, latency: Duration) {
        let Some(handle) = self.get(id) else { return };

        let transition = {
            let mut state = handle.state.lock().unwrap();
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            state.total_successes += 1;

            let ms = latency.as_secs_f64() * 1000.0;
            state.latency_ms = if state.total_successes == 1 {
                ms
            } else {
                state.latency_ms * (1.0 - LATENCY_ALPHA) + ms * LATENCY_ALPHA
            };
            state.success_rate = state.success_rate * (1.0 - SUCCESS_ALPHA) + SUCCESS_ALPHA;

            let old = state.status;
            let new = match old {
                HealthStatus::Failed => {
                    if state.consecutive_successes >= self.thresholds.recovery_threshold {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Failed
                    }
                }
                _ => HealthStatus::Healthy,
            };
            state.status = new;
            (old != new).then_some((old, new))
        };

        self.emit_transition(id, transition);
        crate::metrics::record_provider_call(id, true, latency.as_secs_f64());
    }

    /// Record a failed call
    pub fn record_failure(&self, id: &str, error: &str) {
        let Some(handle) = self.get(id) else { return };

        let transition = {
            let mut state = handle.state.lock().unwrap();
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;
            state.total_failures += 1;
            state.success_rate *= 1.0 - SUCCESS_ALPHA;
            state.last_error = Some(error.to_string());

            let old = state.status;
            // Failed is sticky: only the recovery path in record_success
            // clears it
            let new = if old == HealthStatus::Failed
                || state.consecutive_failures >= self.thresholds.failure_threshold
            {
                HealthStatus::Failed
            } else {
                HealthStatus::Degraded
            };
            state.status = new;
            (old != new).then_some((old, new))
        };

        if transition.map(|(_, to)| to) == Some(HealthStatus::Failed) {
            warn!(provider = id, error, "provider marked failed");
        }
        self.emit_transition(id, transition);
        crate::metrics::record_provider_call(id, false, 0.0);
    }

    fn emit_transition(&self, id: &str, transition: Option<(HealthStatus, HealthStatus)>) {
        if let Some((from, to)) = transition {
            crate::metrics::record_provider_health(id, to);
            self.events.publish(BroadcastEvent::ProviderHealthChanged {
                provider_id: id.to_string(),
                from,
                to,
            });
        }
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.get(id)
            .map(|h| h.status() == HealthStatus::Healthy)
            .unwrap_or(false)
    }

    /// Providers of one chain in reliability order: success rate first, then
    /// latency, then configured weight. Failed providers are excluded.
    pub fn select(&self, chain_id: u64, count: usize) -> Vec<Arc<ProviderHandle>> {
        let mut candidates: Vec<(Arc<ProviderHandle>, HealthSnapshot)> = self
            .providers
            .iter()
            .filter(|e| e.value().chain_id == chain_id && e.value().is_selectable())
            .map(|e| {
                let handle = e.value().clone();
                let snap = snapshot_of(&handle);
                (handle, snap)
            })
            .collect();

        candidates.sort_by(|(a, sa), (b, sb)| {
            sb.success_rate
                .partial_cmp(&sa.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    sa.latency_ms
                        .partial_cmp(&sb.latency_ms)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then(b.weight.cmp(&a.weight))
                .then(a.tier.cmp(&b.tier))
        });

        candidates
            .into_iter()
            .take(count)
            .map(|(h, _)| h)
            .collect()
    }

    /// Selection for quorum modes: the returned set must be able to satisfy
    /// the quorum, otherwise the call fails up front.
    pub fn select_for_quorum(
        &self,
        chain_id: u64,
        count: usize,
        quorum: usize,
    ) -> BroadcastResult<Vec<Arc<ProviderHandle>>> {
        let selected = self.select(chain_id, count);
        if selected.len() < quorum {
            return Err(BroadcastError::InsufficientProviders {
                required: quorum,
                healthy: selected.len(),
            });
        }
        Ok(selected)
    }

    /// Snapshot of every registered provider
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        self.providers
            .iter()
            .map(|e| snapshot_of(e.value()))
            .collect()
    }

    /// Probe every provider with a lightweight block-number query and feed
    /// the outcome through the live-traffic record paths.
    pub async fn probe_all(&self) {
        let handles: Vec<Arc<ProviderHandle>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let probes = handles.into_iter().map(|handle| async move {
            handle.limiter.acquire().await;
            let start = std::time::Instant::now();
            let result =
                tokio::time::timeout(self.probe_timeout, handle.endpoint.block_number()).await;

            match result {
                Ok(Ok(block)) => {
                    self.record_success(&handle.id, start.elapsed());
                    crate::metrics::record_chain_height(handle.chain_id, block);
                }
                Ok(Err(e)) => self.record_failure(&handle.id, &e.message),
                Err(_) => self.record_failure(&handle.id, "probe timeout"),
            }
        });

        join_all(probes).await;
    }

    pub fn provider_count(&self, chain_id: u64) -> usize {
        self.providers
            .iter()
            .filter(|e| e.value().chain_id == chain_id)
            .count()
    }
}

fn snapshot_of(handle: &ProviderHandle) -> HealthSnapshot {
    let state = handle.state.lock().unwrap();
    HealthSnapshot {
        id: handle.id.clone(),
        chain_id: handle.chain_id,
        status: state.status,
        success_rate: state.success_rate,
        latency_ms: state.latency_ms,
        consecutive_failures: state.consecutive_failures,
        total_successes: state.total_successes,
        total_failures: state.total_failures,
        last_error: state.last_error.clone(),
    }
}
