//! Confirmation monitoring for pending broadcasts
//!
//! Polls receipts for `Pending` records in bounded batches. A receipt with a
//! success status accrues confirmations until the profile's requirement is
//! met; a revert is terminal; a broadcast with no receipt inside the
//! confirmation window times out and is handed to the retry planner.

use crate::broadcast::record::{BroadcastRecord, BroadcastState, RecordStore};
use crate::broadcast::retry::{RetryManager, RetryPlan};
use crate::config::{NetworkProfile, StrategyMode};
use crate::error::BroadcastError;
use crate::events::{BroadcastEvent, EventBus};
use crate::provider::health::ProviderHealthRegistry;
use crate::tx::nonce::NonceManager;

use chrono::Utc;
use ethers::types::H256;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub struct BroadcastMonitor {
    store: Arc<RecordStore>,
    registry: Arc<ProviderHealthRegistry>,
    nonces: Arc<NonceManager>,
    retry: Arc<dyn RetryManager>,
    events: EventBus,
    /// Enabled network profiles keyed by chain id
    networks: HashMap<u64, NetworkProfile>,
    batch_size: usize,
    interval: Duration,
    retry_tx: mpsc::UnboundedSender<RetryPlan>,
}

impl BroadcastMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<RecordStore>,
        registry: Arc<ProviderHealthRegistry>,
        nonces: Arc<NonceManager>,
        retry: Arc<dyn RetryManager>,
        events: EventBus,
        networks: HashMap<u64, NetworkProfile>,
        batch_size: usize,
        interval: Duration,
        retry_tx: mpsc::UnboundedSender<RetryPlan>,
    ) -> Self {
        Self {
            store,
            registry,
            nonces,
            retry,
            events,
            networks,
            batch_size,
            interval,
            retry_tx,
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval = ?self.interval, "confirmation monitor started");
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One monitoring pass: concurrent receipt polls over at most
    /// `batch_size` pending records
    pub async fn tick(&self) {
        let pending = self.store.in_state(BroadcastState::Pending).await;
        let checks = pending
            .into_iter()
            .take(self.batch_size)
            .map(|handle| self.check(handle));
        join_all(checks).await;
    }

    async fn check(&self, handle: Arc<RwLock<BroadcastRecord>>) {
        let (id, chain_id, tx_hash, broadcast_at, mode) = {
            let record = handle.read().await;
            (
                record.id,
                record.request.chain_id,
                record.primary_hash(),
                record.broadcast_at,
                record.mode,
            )
        };
        let Some(profile) = self.networks.get(&chain_id) else {
            warn!(broadcast = %id, chain_id, "pending record on an unconfigured chain");
            return;
        };
        let Some(tx_hash) = tx_hash else {
            warn!(broadcast = %id, "pending record without a transaction hash");
            return;
        };

        let providers = self.registry.select(chain_id, 1);
        let Some(provider) = providers.first() else {
            debug!(chain_id, "no selectable provider for receipt polling");
            return;
        };

        provider.limiter.acquire().await;
        let start = Instant::now();
        let receipt = provider.endpoint.transaction_receipt(tx_hash).await;
        match receipt {
            Ok(Some(receipt)) => {
                self.registry.record_success(&provider.id, start.elapsed());
                let reverted = receipt.status.map(|s| s.as_u64()) == Some(0);
                if reverted {
                    self.reject(&handle, id, chain_id, tx_hash).await;
                    return;
                }

                let Some(receipt_block) = receipt.block_number.map(|b| b.as_u64()) else {
                    return;
                };

                // Consensus-mode records stay suspect until independent
                // providers agree on the receipt itself
                if mode == StrategyMode::Consensus
                    && !self
                        .receipts_agree(chain_id, tx_hash, &receipt, &provider.id)
                        .await
                {
                    self.fail_divergent(&handle, id, chain_id, tx_hash).await;
                    return;
                }

                let current = match provider.endpoint.block_number().await {
                    Ok(block) => block,
                    Err(e) => {
                        self.registry.record_failure(&provider.id, &e.message);
                        return;
                    }
                };
                let confirmations = current.saturating_sub(receipt_block) + 1;
                self.confirm(
                    &handle,
                    id,
                    chain_id,
                    tx_hash,
                    receipt_block,
                    confirmations,
                    profile,
                )
                .await;
            }
            Ok(None) => {
                let elapsed = broadcast_at
                    .map(|at| (Utc::now() - at).num_seconds())
                    .unwrap_or(0);
                if elapsed >= profile.timeout_secs as i64 {
                    self.time_out(&handle, id, chain_id, profile).await;
                }
            }
            Err(e) => {
                self.registry.record_failure(&provider.id, &e.message);
                debug!(broadcast = %id, error = %e.message, "receipt poll failed");
            }
        }
    }

    /// Compare the receipt against other providers' view of it. A missing
    /// receipt elsewhere is propagation lag, not divergence; conflicting
    /// fields are.
    async fn receipts_agree(
        &self,
        chain_id: u64,
        tx_hash: H256,
        primary: &ethers::types::TransactionReceipt,
        polled: &str,
    ) -> bool {
        for provider in self.registry.select(chain_id, 3) {
            if provider.id == polled {
                continue;
            }
            provider.limiter.acquire().await;
            let start = Instant::now();
            match provider.endpoint.transaction_receipt(tx_hash).await {
                Ok(Some(other)) => {
                    self.registry.record_success(&provider.id, start.elapsed());
                    if other.block_number != primary.block_number
                        || other.gas_used != primary.gas_used
                        || other.status != primary.status
                    {
                        warn!(
                            tx_hash = %tx_hash,
                            provider = %provider.id,
                            "receipt fields diverge between providers"
                        );
                        return false;
                    }
                }
                Ok(None) => {
                    self.registry.record_success(&provider.id, start.elapsed());
                }
                Err(e) => {
                    self.registry.record_failure(&provider.id, &e.message);
                }
            }
        }
        true
    }

    async fn fail_divergent(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: uuid::Uuid,
        chain_id: u64,
        tx_hash: H256,
    ) {
        {
            let mut record = handle.write().await;
            if record.transition(BroadcastState::Failed).is_err() {
                return;
            }
        }
        self.events.publish(BroadcastEvent::Failed {
            id,
            reason: format!("providers disagree on the receipt for {}", tx_hash),
        });
        crate::metrics::record_broadcast_outcome(chain_id, BroadcastState::Failed.as_str());
        self.store.evict(&id).await;
    }

    async fn confirm(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: uuid::Uuid,
        chain_id: u64,
        tx_hash: H256,
        block_number: u64,
        confirmations: u64,
        profile: &NetworkProfile,
    ) {
        let done = {
            let mut record = handle.write().await;
            record.confirmations = confirmations;
            if confirmations >= profile.required_confirmations {
                if record.transition(BroadcastState::Confirmed).is_err() {
                    return;
                }
                true
            } else {
                false
            }
        };
        if !done {
            debug!(
                broadcast = %id,
                confirmations,
                required = profile.required_confirmations,
                "confirmation progress"
            );
            return;
        }

        let (from, nonce) = {
            let record = handle.read().await;
            (record.request.from, record.nonce)
        };
        if let Some(nonce) = nonce {
            self.nonces.complete(from, chain_id, nonce).await;
        }
        info!(broadcast = %id, tx_hash = %tx_hash, block_number, "broadcast confirmed");
        self.events.publish(BroadcastEvent::Confirmed {
            id,
            tx_hash,
            block_number,
            confirmations,
        });
        crate::metrics::record_broadcast_outcome(chain_id, BroadcastState::Confirmed.as_str());
        self.store.evict(&id).await;
    }

    async fn reject(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: uuid::Uuid,
        chain_id: u64,
        tx_hash: H256,
    ) {
        let (from, nonce) = {
            let mut record = handle.write().await;
            if record.transition(BroadcastState::Rejected).is_err() {
                return;
            }
            (record.request.from, record.nonce)
        };
        // A reverted transaction still consumed its nonce
        if let Some(nonce) = nonce {
            self.nonces.complete(from, chain_id, nonce).await;
        }
        warn!(broadcast = %id, tx_hash = %tx_hash, "transaction reverted on-chain");
        self.events.publish(BroadcastEvent::Failed {
            id,
            reason: format!("transaction {} reverted on-chain", tx_hash),
        });
        crate::metrics::record_broadcast_outcome(chain_id, BroadcastState::Rejected.as_str());
        self.store.evict(&id).await;
    }

    async fn time_out(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: uuid::Uuid,
        chain_id: u64,
        profile: &NetworkProfile,
    ) {
        let snapshot = {
            let mut record = handle.write().await;
            if record.transition(BroadcastState::TimedOut).is_err() {
                return;
            }
            record.clone()
        };
        warn!(broadcast = %id, "no receipt within the confirmation window");
        self.events.publish(BroadcastEvent::TimedOut { id });
        crate::metrics::record_broadcast_outcome(chain_id, BroadcastState::TimedOut.as_str());
        self.store.evict(&id).await;

        let error = BroadcastError::Timeout {
            operation: "confirmation".to_string(),
        };
        if let Some(plan) = self.retry.plan(&snapshot, &error, profile) {
            // Channel closure only happens at shutdown
            let _ = self.retry_tx.send(plan);
        }
    }
}
