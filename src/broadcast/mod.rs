//! Broadcast orchestration service
//!
//! `BroadcastService` ties the queue, the record store, the strategy engine,
//! and the retry planner together behind the handful of operations the API
//! exposes. Dispatch is pull-based: a ticker drains the queue into spawned
//! strategy executions, bounded by a concurrency semaphore.

pub mod monitor;
pub mod record;
pub mod retry;
pub mod strategy;

pub use monitor::BroadcastMonitor;
pub use record::{BroadcastRecord, BroadcastState, RecordStore, TransactionRequest};
pub use retry::{GasEscalatingRetry, RetryManager, RetryPlan};
pub use strategy::{BroadcastStrategy, StrategySettings};

use crate::config::{BroadcasterConfig, NetworkProfile, StrategyMode};
use crate::error::{BroadcastError, BroadcastResult};
use crate::events::{BroadcastEvent, EventBus};
use crate::provider::endpoint::TxSigner;
use crate::provider::health::{HealthSnapshot, ProviderHealthRegistry};
use crate::queue::{BroadcastQueue, MetricsInstrumentation, QueueStats, ValidationRules};
use crate::tx::nonce::NonceManager;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

pub struct BroadcastService {
    queue: Arc<BroadcastQueue>,
    store: Arc<RecordStore>,
    nonces: Arc<NonceManager>,
    registry: Arc<ProviderHealthRegistry>,
    strategy: Arc<BroadcastStrategy>,
    retry: Arc<dyn RetryManager>,
    events: EventBus,
    networks: HashMap<u64, NetworkProfile>,
    default_mode: StrategyMode,
    dispatch_interval: Duration,
    inflight: Arc<Semaphore>,
}

impl BroadcastService {
    /// Wire the service and its confirmation monitor from one config. The
    /// returned receiver carries retry plans out of the monitor and belongs
    /// in `run_retries`.
    pub fn build(
        config: &BroadcasterConfig,
        networks: HashMap<u64, NetworkProfile>,
        registry: Arc<ProviderHealthRegistry>,
        signer: Arc<dyn TxSigner>,
        events: EventBus,
    ) -> (
        Arc<Self>,
        BroadcastMonitor,
        mpsc::UnboundedReceiver<RetryPlan>,
    ) {
        let store = Arc::new(RecordStore::new(config.history_capacity));
        let nonces = Arc::new(NonceManager::new());
        let retry: Arc<dyn RetryManager> = Arc::new(GasEscalatingRetry::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
            events.clone(),
        ));
        let strategy = Arc::new(BroadcastStrategy::new(
            registry.clone(),
            nonces.clone(),
            signer,
            events.clone(),
            StrategySettings::from_config(config),
        ));
        let queue = Arc::new(BroadcastQueue::new(
            config.queue_capacity,
            config.overflow_policy,
            config.priority_enabled,
            ValidationRules {
                known_chains: networks.keys().copied().collect(),
                ..Default::default()
            },
            Arc::new(MetricsInstrumentation),
            events.clone(),
        ));

        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let monitor = BroadcastMonitor::new(
            store.clone(),
            registry.clone(),
            nonces.clone(),
            retry.clone(),
            events.clone(),
            networks.clone(),
            config.monitor_batch_size,
            Duration::from_millis(config.monitor_interval_ms),
            retry_tx,
        );

        let service = Arc::new(Self {
            queue,
            store,
            nonces,
            registry,
            strategy,
            retry,
            events,
            networks,
            default_mode: config.default_mode,
            dispatch_interval: Duration::from_millis(config.dispatch_interval_ms),
            inflight: Arc::new(Semaphore::new(config.max_concurrent)),
        });
        (service, monitor, retry_rx)
    }

    /// Accept a request: create its record, then queue it. A `drop-newest`
    /// refusal is not an error toward the caller; the record fails silently.
    pub async fn enqueue_broadcast(
        &self,
        request: TransactionRequest,
        mode: Option<StrategyMode>,
    ) -> BroadcastResult<Uuid> {
        let mode = mode.unwrap_or(self.default_mode);
        let chain_id = request.chain_id;
        let id = Uuid::new_v4();
        self.store
            .insert(BroadcastRecord::new(id, request.clone(), mode));

        match self.queue.enqueue(id, request) {
            Ok(outcome) if outcome.accepted => {
                if let Some(evicted) = outcome.evicted {
                    crate::metrics::record_queue_overflow("drop-oldest");
                    self.discard(evicted, "dropped by overflow policy").await;
                }
                self.events
                    .publish(BroadcastEvent::Enqueued { id, chain_id });
                debug!(broadcast = %id, chain_id, depth = outcome.depth, "broadcast enqueued");
                Ok(id)
            }
            Ok(_) => {
                crate::metrics::record_queue_overflow("drop-newest");
                self.queue.notice_refused();
                self.discard(id, "dropped by overflow policy").await;
                Ok(id)
            }
            Err(e) => {
                self.discard(id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Snapshot of an active or historical broadcast
    pub async fn get_status(&self, id: Uuid) -> BroadcastResult<BroadcastRecord> {
        self.store
            .snapshot(&id)
            .await
            .ok_or(BroadcastError::RecordNotFound { id: id.to_string() })
    }

    /// Stop tracking a broadcast. Only queued and pending broadcasts can be
    /// cancelled; a transaction already accepted by the network may still
    /// land regardless.
    pub async fn cancel(&self, id: Uuid) -> BroadcastResult<()> {
        self.queue.remove_by_id(&id);

        let Some(handle) = self.store.get(&id) else {
            if let Some(snapshot) = self.store.snapshot(&id).await {
                return Err(BroadcastError::InvalidStateTransition {
                    from: snapshot.state.as_str().to_string(),
                    to: BroadcastState::Cancelled.as_str().to_string(),
                });
            }
            return Err(BroadcastError::RecordNotFound { id: id.to_string() });
        };

        let chain_id = {
            let mut record = handle.write().await;
            record.transition(BroadcastState::Cancelled)?;
            record.request.chain_id
        };
        info!(broadcast = %id, "broadcast cancelled");
        self.events.publish(BroadcastEvent::Cancelled { id });
        crate::metrics::record_broadcast_outcome(chain_id, BroadcastState::Cancelled.as_str());
        self.store.evict(&id).await;
        Ok(())
    }

    pub fn provider_health(&self) -> Vec<HealthSnapshot> {
        self.registry.snapshots()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.events.subscribe()
    }

    /// Drain the queue into bounded concurrent strategy executions
    pub async fn run_dispatcher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.dispatch_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval = ?self.dispatch_interval, "dispatcher started");
        loop {
            ticker.tick().await;
            self.clone().dispatch_pending().await;
        }
    }

    /// One dispatcher pass: spawn executions while permits and entries last
    pub async fn dispatch_pending(self: Arc<Self>) {
        loop {
            let Ok(permit) = self.inflight.clone().try_acquire_owned() else {
                break;
            };
            let Some(entry) = self.queue.dequeue() else {
                break;
            };
            let service = self.clone();
            tokio::spawn(async move {
                service.dispatch(entry.id).await;
                drop(permit);
            });
        }
    }

    /// Consume retry plans coming out of the confirmation monitor
    pub async fn run_retries(self: Arc<Self>, mut retry_rx: mpsc::UnboundedReceiver<RetryPlan>) {
        while let Some(plan) = retry_rx.recv().await {
            Self::spawn_retry(self.clone(), plan);
        }
    }

    async fn dispatch(self: Arc<Self>, id: Uuid) {
        let Some(handle) = self.store.get(&id) else {
            // Cancelled between dequeue and dispatch
            return;
        };
        let chain_id = handle.read().await.request.chain_id;
        let Some(profile) = self.networks.get(&chain_id).cloned() else {
            return;
        };

        if let Err(error) = self.strategy.execute(handle.clone(), &profile).await {
            let snapshot = handle.read().await.clone();
            self.store.evict(&id).await;
            if let Some(plan) = self.retry.plan(&snapshot, &error, &profile) {
                Self::spawn_retry(self.clone(), plan);
            }
        }
    }

    /// Run a successor chain to completion in its own task
    fn spawn_retry(service: Arc<BroadcastService>, plan: RetryPlan) {
        tokio::spawn(async move {
            let mut next = Some(plan);
            while let Some(plan) = next.take() {
                tokio::time::sleep(plan.delay).await;

                let chain_id = plan.record.request.chain_id;
                let Some(profile) = service.networks.get(&chain_id).cloned() else {
                    break;
                };
                let id = plan.record.id;
                let handle = service.store.insert(plan.record);

                match service.strategy.execute(handle.clone(), &profile).await {
                    Ok(_) => break,
                    Err(error) => {
                        let snapshot = handle.read().await.clone();
                        service.store.evict(&id).await;
                        next = service.retry.plan(&snapshot, &error, &profile);
                    }
                }
            }
        });
    }

    async fn discard(&self, id: Uuid, reason: &str) {
        if let Some(handle) = self.store.get(&id) {
            let mut record = handle.write().await;
            if !record.state.is_terminal() {
                let _ = record.transition(BroadcastState::Failed);
            }
        }
        self.events.publish(BroadcastEvent::Failed {
            id,
            reason: reason.to_string(),
        });
        self.store.evict(&id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::provider::health::HealthThresholds;
    use crate::provider::rate_limit::RateLimiter;
    use crate::testing::{test_profile, test_request, MockEndpoint, MockSigner};

    fn test_config() -> BroadcasterConfig {
        BroadcasterConfig {
            instance_id: "test".to_string(),
            queue_capacity: 16,
            overflow_policy: OverflowPolicy::Reject,
            priority_enabled: false,
            dispatch_interval_ms: 10,
            max_concurrent: 4,
            default_mode: StrategyMode::Failover,
            fanout: 3,
            quorum_size: 2,
            coordination_timeout_ms: 5000,
            attempt_timeout_secs: 5,
            max_provider_attempts: 3,
            retry_delay_ms: 10,
            max_retries: 3,
            monitor_interval_ms: 50,
            monitor_batch_size: 25,
            history_capacity: 32,
            probe_interval_secs: 30,
            failure_threshold: 3,
            recovery_threshold: 2,
            rate_limit_per_sec: 1000.0,
            rate_limit_burst: 1000.0,
        }
    }

    fn harness(config: BroadcasterConfig) -> (Arc<BroadcastService>, Arc<MockEndpoint>) {
        let events = EventBus::new(256);
        let registry = Arc::new(ProviderHealthRegistry::new(
            HealthThresholds::default(),
            events.clone(),
        ));
        let endpoint = Arc::new(MockEndpoint::new());
        registry.register(
            "p0",
            1,
            1,
            0,
            endpoint.clone(),
            RateLimiter::new(1000.0, 1000.0),
        );

        let mut networks = HashMap::new();
        networks.insert(1, test_profile(1));
        let (service, _monitor, _retry_rx) = BroadcastService::build(
            &config,
            networks,
            registry,
            Arc::new(MockSigner::new()),
            events,
        );
        (service, endpoint)
    }

    #[tokio::test]
    async fn enqueue_creates_a_tracked_record() {
        let (service, _) = harness(test_config());
        let id = service
            .enqueue_broadcast(test_request(1), None)
            .await
            .unwrap();

        let record = service.get_status(id).await.unwrap();
        assert_eq!(record.state, BroadcastState::Preparing);
        assert_eq!(record.mode, StrategyMode::Failover);
        assert_eq!(service.queue_stats().depth, 1);
    }

    #[tokio::test]
    async fn unknown_chain_is_rejected_at_enqueue() {
        let (service, _) = harness(test_config());
        let err = service
            .enqueue_broadcast(test_request(999), None)
            .await
            .unwrap_err();
        assert!(matches!(err, BroadcastError::ChainNotFound { .. }));
        assert_eq!(service.queue_stats().depth, 0);
    }

    #[tokio::test]
    async fn dispatch_runs_a_broadcast_to_pending() {
        let (service, endpoint) = harness(test_config());
        let id = service
            .enqueue_broadcast(test_request(1), Some(StrategyMode::Single))
            .await
            .unwrap();

        service.clone().dispatch_pending().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = service.get_status(id).await.unwrap();
        assert_eq!(record.state, BroadcastState::Pending);
        assert_eq!(endpoint.sent_count(), 1);
        assert_eq!(service.queue_stats().depth, 0);
    }

    #[tokio::test]
    async fn cancel_removes_a_queued_broadcast() {
        let (service, endpoint) = harness(test_config());
        let id = service
            .enqueue_broadcast(test_request(1), None)
            .await
            .unwrap();

        service.cancel(id).await.unwrap();
        assert_eq!(service.queue_stats().depth, 0);
        assert_eq!(
            service.get_status(id).await.unwrap().state,
            BroadcastState::Cancelled
        );

        // Nothing left to dispatch
        service.clone().dispatch_pending().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(endpoint.sent_count(), 0);
    }

    #[tokio::test]
    async fn cancel_of_an_unknown_broadcast_is_an_error() {
        let (service, _) = harness(test_config());
        let err = service.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BroadcastError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_of_a_finished_broadcast_is_an_error() {
        let (service, _) = harness(test_config());
        let id = service
            .enqueue_broadcast(test_request(1), Some(StrategyMode::Single))
            .await
            .unwrap();
        service.clone().dispatch_pending().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Pending broadcasts can be cancelled, but only once
        service.cancel(id).await.unwrap();
        let err = service.cancel(id).await.unwrap_err();
        assert!(matches!(err, BroadcastError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn drop_newest_accepts_the_call_but_fails_the_record() {
        let mut config = test_config();
        config.queue_capacity = 1;
        config.overflow_policy = OverflowPolicy::DropNewest;
        let (service, _) = harness(config);

        let first = service
            .enqueue_broadcast(test_request(1), None)
            .await
            .unwrap();
        let second = service
            .enqueue_broadcast(test_request(1), None)
            .await
            .unwrap();

        assert_eq!(service.queue_stats().depth, 1);
        assert_eq!(
            service.get_status(first).await.unwrap().state,
            BroadcastState::Preparing
        );
        assert_eq!(
            service.get_status(second).await.unwrap().state,
            BroadcastState::Failed
        );
    }

    #[tokio::test]
    async fn transient_failure_is_retried_to_success() {
        let (service, endpoint) = harness(test_config());
        endpoint.fail_sends("connection reset by peer", 1);

        service
            .enqueue_broadcast(test_request(1), Some(StrategyMode::Single))
            .await
            .unwrap();
        service.clone().dispatch_pending().await;

        // First attempt fails, the successor runs after the retry delay
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pending = service
            .store
            .in_state(BroadcastState::Pending)
            .await;
        assert_eq!(pending.len(), 1);
        let record = pending[0].read().await.clone();
        assert_eq!(record.attempt, 2);
        assert!(record.predecessor.is_some());
        assert_eq!(endpoint.sent_count(), 2);
    }
}
