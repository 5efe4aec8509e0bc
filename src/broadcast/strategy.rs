//! Broadcast strategies
//!
//! One pipeline (lease nonce, resolve fees, sign) feeding six coordination
//! modes over the selected provider set. Every provider attempt is recorded
//! on the broadcast record and fed back into the health registry; the nonce
//! is released only when no provider accepted anything.

use crate::broadcast::record::{
    BroadcastRecord, BroadcastState, ProviderOutcome, TransactionRequest,
};
use crate::config::{BroadcasterConfig, NetworkProfile, StrategyMode};
use crate::error::{classify, provider_error, BroadcastError, BroadcastResult, ErrorKind};
use crate::events::{BroadcastEvent, EventBus};
use crate::provider::endpoint::TxSigner;
use crate::provider::health::{ProviderHandle, ProviderHealthRegistry};
use crate::tx::gas::{self, GasFees};
use crate::tx::nonce::NonceManager;

use ethers::types::transaction::eip1559::Eip1559TransactionRequest;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Bytes, TransactionRequest as LegacyRequest, H256, U256};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Knobs the strategy engine needs from the broadcaster config
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub fanout: usize,
    pub quorum_size: usize,
    pub max_provider_attempts: u32,
    pub attempt_timeout: Duration,
    pub coordination_timeout: Duration,
}

impl StrategySettings {
    pub fn from_config(config: &BroadcasterConfig) -> Self {
        Self {
            fanout: config.fanout,
            quorum_size: config.quorum_size,
            max_provider_attempts: config.max_provider_attempts,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            coordination_timeout: Duration::from_millis(config.coordination_timeout_ms),
        }
    }
}

/// Executes broadcasts against the provider set in the record's mode
pub struct BroadcastStrategy {
    registry: Arc<ProviderHealthRegistry>,
    nonces: Arc<NonceManager>,
    signer: Arc<dyn TxSigner>,
    events: EventBus,
    settings: StrategySettings,
}

impl BroadcastStrategy {
    pub fn new(
        registry: Arc<ProviderHealthRegistry>,
        nonces: Arc<NonceManager>,
        signer: Arc<dyn TxSigner>,
        events: EventBus,
        settings: StrategySettings,
    ) -> Self {
        Self {
            registry,
            nonces,
            signer,
            events,
            settings,
        }
    }

    /// Drive one record from `Preparing` to `Pending` (or a terminal failure)
    pub async fn execute(
        &self,
        handle: Arc<RwLock<BroadcastRecord>>,
        profile: &NetworkProfile,
    ) -> BroadcastResult<H256> {
        let (id, request, mode) = {
            let record = handle.read().await;
            (record.id, record.request.clone(), record.mode)
        };

        {
            let mut record = handle.write().await;
            // Cancelled while queued: nothing to do
            if record.state.is_terminal() {
                return Err(BroadcastError::InvalidStateTransition {
                    from: record.state.as_str().to_string(),
                    to: BroadcastState::Validating.as_str().to_string(),
                });
            }
            record.transition(BroadcastState::Validating)?;
        }
        crate::metrics::record_broadcast_attempt(request.chain_id, mode.as_str());

        let leased = request.nonce.is_none();
        match self.run(&handle, id, &request, mode, profile).await {
            Ok(tx_hash) => {
                let provider_id = {
                    let mut record = handle.write().await;
                    record.transition(BroadcastState::Pending)?;
                    record
                        .successful_providers()
                        .into_iter()
                        .next()
                        .unwrap_or_default()
                };
                self.events.publish(BroadcastEvent::Sent {
                    id,
                    tx_hash,
                    provider_id,
                });
                Ok(tx_hash)
            }
            Err(e) => {
                self.fail(&handle, id, &request, leased, &e).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: Uuid,
        request: &TransactionRequest,
        mode: StrategyMode,
        profile: &NetworkProfile,
    ) -> BroadcastResult<H256> {
        let providers = self.select_providers(request.chain_id, mode)?;
        let endpoint = providers[0].endpoint.clone();

        let nonce = match request.nonce {
            Some(n) => n,
            None => {
                self.nonces
                    .lease(request.from, request.chain_id, endpoint.as_ref())
                    .await?
            }
        };
        let fees = gas::resolve(request.fee_override, profile, endpoint.as_ref()).await?;

        {
            let mut record = handle.write().await;
            record.nonce = Some(nonce);
            record.fees = Some(fees);
        }
        self.events.publish(BroadcastEvent::Prepared { id, nonce });

        let tx = build_transaction(request, nonce, fees);
        let raw = self.signer.sign_transaction(&tx).await?;
        debug!(
            broadcast = %id,
            nonce,
            mode = mode.as_str(),
            payload = %payload_preview(&raw),
            "transaction signed"
        );

        {
            let mut record = handle.write().await;
            record.transition(BroadcastState::Broadcasting)?;
        }

        let started = Instant::now();
        let tx_hash = match mode {
            StrategyMode::Single => self.submit_single(handle, request, &providers, nonce, &raw).await,
            StrategyMode::Failover => {
                self.submit_failover(handle, request, &providers, nonce, fees, raw, profile)
                    .await
            }
            StrategyMode::Parallel => self.submit_parallel(handle, id, &providers, &raw).await,
            StrategyMode::Racing => self.submit_racing(handle, &providers, &raw).await,
            StrategyMode::Quorum => self.submit_quorum(handle, id, &providers, &raw).await,
            StrategyMode::Consensus => self.submit_consensus(handle, id, &providers, &raw).await,
        }?;

        crate::metrics::record_broadcast_latency(request.chain_id, started.elapsed().as_secs_f64());
        Ok(tx_hash)
    }

    fn select_providers(
        &self,
        chain_id: u64,
        mode: StrategyMode,
    ) -> BroadcastResult<Vec<Arc<ProviderHandle>>> {
        let providers = match mode {
            StrategyMode::Single => self.registry.select(chain_id, 1),
            StrategyMode::Failover => self
                .registry
                .select(chain_id, self.settings.max_provider_attempts as usize),
            StrategyMode::Parallel | StrategyMode::Racing => {
                self.registry.select(chain_id, self.settings.fanout)
            }
            StrategyMode::Quorum | StrategyMode::Consensus => self.registry.select_for_quorum(
                chain_id,
                self.settings.fanout,
                self.settings.quorum_size,
            )?,
        };
        if providers.is_empty() {
            return Err(BroadcastError::InsufficientProviders {
                required: 1,
                healthy: 0,
            });
        }
        Ok(providers)
    }

    /// One rate-limited, timeout-bounded send against one provider. The
    /// outcome lands on the record and in the health registry either way.
    async fn attempt(
        &self,
        provider: Arc<ProviderHandle>,
        raw: Bytes,
        handle: &Arc<RwLock<BroadcastRecord>>,
    ) -> (String, Result<(H256, u64), String>) {
        Self::attempt_with(
            self.registry.clone(),
            provider,
            raw,
            handle.clone(),
            self.settings.attempt_timeout,
        )
        .await
    }

    /// Owned-argument form of `attempt`, spawnable as a free-running task
    async fn attempt_with(
        registry: Arc<ProviderHealthRegistry>,
        provider: Arc<ProviderHandle>,
        raw: Bytes,
        handle: Arc<RwLock<BroadcastRecord>>,
        attempt_timeout: Duration,
    ) -> (String, Result<(H256, u64), String>) {
        provider.limiter.acquire().await;
        let start = Instant::now();
        let result = tokio::time::timeout(
            attempt_timeout,
            provider.endpoint.send_raw_transaction(raw),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(tx_hash)) => {
                registry.record_success(&provider.id, start.elapsed());
                Ok((tx_hash, latency_ms))
            }
            Ok(Err(e)) => {
                registry.record_failure(&provider.id, &e.message);
                Err(e.message)
            }
            Err(_) => {
                registry.record_failure(&provider.id, "send timeout");
                Err("send timeout".to_string())
            }
        };

        {
            let mut record = handle.write().await;
            match &outcome {
                Ok((tx_hash, ms)) => {
                    record.record_outcome(ProviderOutcome::success(&provider.id, *tx_hash, *ms))
                }
                Err(message) => {
                    record.record_outcome(ProviderOutcome::failure(&provider.id, message, latency_ms))
                }
            }
        }

        (provider.id.clone(), outcome)
    }

    async fn submit_single(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        request: &TransactionRequest,
        providers: &[Arc<ProviderHandle>],
        nonce: u64,
        raw: &Bytes,
    ) -> BroadcastResult<H256> {
        let (provider_id, result) = self.attempt(providers[0].clone(), raw.clone(), handle).await;
        match result {
            Ok((tx_hash, _)) => Ok(tx_hash),
            Err(message) => Err(provider_error(
                &provider_id,
                request.chain_id,
                &format!("{:?}", request.from),
                nonce,
                &message,
            )),
        }
    }

    /// Sequential attempts in reliability order. Underpriced rejections
    /// escalate fees and re-sign before the next provider; fatal rejections
    /// abort immediately.
    async fn submit_failover(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        request: &TransactionRequest,
        providers: &[Arc<ProviderHandle>],
        nonce: u64,
        mut fees: GasFees,
        mut raw: Bytes,
        profile: &NetworkProfile,
    ) -> BroadcastResult<H256> {
        let mut errors: Vec<(String, String)> = Vec::new();
        let address = format!("{:?}", request.from);

        for provider in providers
            .iter()
            .take(self.settings.max_provider_attempts as usize)
        {
            let (provider_id, result) = self.attempt(provider.clone(), raw.clone(), handle).await;
            let message = match result {
                Ok((tx_hash, _)) => return Ok(tx_hash),
                Err(message) => message,
            };
            errors.push((provider_id.clone(), message.clone()));

            match classify(&message) {
                ErrorKind::Underpriced => {
                    fees = gas::escalate(fees, profile);
                    handle.write().await.fees = Some(fees);
                    let tx = build_transaction(request, nonce, fees);
                    raw = self.signer.sign_transaction(&tx).await?;
                    debug!(
                        provider = %provider_id,
                        fees = ?fees,
                        "underpriced, escalated fees for next attempt"
                    );
                }
                ErrorKind::Transient | ErrorKind::NonceTooHigh => {}
                _ => {
                    return Err(provider_error(
                        &provider_id,
                        request.chain_id,
                        &address,
                        nonce,
                        &message,
                    ))
                }
            }
        }

        Err(BroadcastError::AllBroadcastsFailed {
            attempts: errors.len() as u32,
            errors,
        })
    }

    /// Concurrent attempts against all selected providers, bounded by the
    /// coordination timeout.
    async fn fanout(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        providers: &[Arc<ProviderHandle>],
        raw: &Bytes,
    ) -> BroadcastResult<Vec<(String, Result<(H256, u64), String>)>> {
        let attempts = providers
            .iter()
            .map(|p| self.attempt(p.clone(), raw.clone(), handle));
        tokio::time::timeout(self.settings.coordination_timeout, join_all(attempts))
            .await
            .map_err(|_| BroadcastError::Timeout {
                operation: "broadcast fan-out".to_string(),
            })
    }

    async fn submit_parallel(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: Uuid,
        providers: &[Arc<ProviderHandle>],
        raw: &Bytes,
    ) -> BroadcastResult<H256> {
        let results = self.fanout(handle, providers, raw).await?;
        let successes: Vec<(String, H256)> = results
            .iter()
            .filter_map(|(pid, r)| r.as_ref().ok().map(|(h, _)| (pid.clone(), *h)))
            .collect();

        if successes.is_empty() {
            return Err(all_failed(results));
        }

        self.check_hash_agreement(id, &successes);
        let primary = handle
            .read()
            .await
            .primary_hash()
            .unwrap_or(successes[0].1);
        Ok(primary)
    }

    /// First acceptance wins. Losing attempts run to completion in their own
    /// tasks so their outcomes still reach the record and the health registry.
    async fn submit_racing(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        providers: &[Arc<ProviderHandle>],
        raw: &Bytes,
    ) -> BroadcastResult<H256> {
        let (results_tx, mut results_rx) = mpsc::channel(providers.len());
        for provider in providers {
            let results_tx = results_tx.clone();
            let attempt = Self::attempt_with(
                self.registry.clone(),
                provider.clone(),
                raw.clone(),
                handle.clone(),
                self.settings.attempt_timeout,
            );
            tokio::spawn(async move {
                let _ = results_tx.send(attempt.await).await;
            });
        }
        drop(results_tx);

        let race = async {
            let mut errors: Vec<(String, String)> = Vec::new();
            while let Some((provider_id, result)) = results_rx.recv().await {
                match result {
                    Ok((tx_hash, _)) => return Ok(tx_hash),
                    Err(message) => errors.push((provider_id, message)),
                }
            }
            Err(BroadcastError::AllBroadcastsFailed {
                attempts: errors.len() as u32,
                errors,
            })
        };

        tokio::time::timeout(self.settings.coordination_timeout, race)
            .await
            .map_err(|_| BroadcastError::Timeout {
                operation: "broadcast race".to_string(),
            })?
    }

    async fn submit_quorum(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: Uuid,
        providers: &[Arc<ProviderHandle>],
        raw: &Bytes,
    ) -> BroadcastResult<H256> {
        let results = self.fanout(handle, providers, raw).await?;
        let successes: Vec<(String, H256)> = results
            .iter()
            .filter_map(|(pid, r)| r.as_ref().ok().map(|(h, _)| (pid.clone(), *h)))
            .collect();

        if successes.len() < self.settings.quorum_size {
            return Err(BroadcastError::QuorumNotReached {
                required: self.settings.quorum_size,
                achieved: successes.len(),
                successful_providers: successes.into_iter().map(|(pid, _)| pid).collect(),
            });
        }

        self.check_hash_agreement(id, &successes);
        let primary = handle
            .read()
            .await
            .primary_hash()
            .unwrap_or(successes[0].1);
        Ok(primary)
    }

    /// Quorum with hash agreement on top: enough providers must accept, and
    /// every acceptance must carry the same hash. Minority rejections are
    /// tolerated down to the quorum threshold. Acceptances survive a
    /// consensus failure in the error payload, so the caller knows the
    /// transaction may still land.
    async fn submit_consensus(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: Uuid,
        providers: &[Arc<ProviderHandle>],
        raw: &Bytes,
    ) -> BroadcastResult<H256> {
        let results = self.fanout(handle, providers, raw).await?;
        let successes: Vec<(String, H256)> = results
            .iter()
            .filter_map(|(pid, r)| r.as_ref().ok().map(|(h, _)| (pid.clone(), *h)))
            .collect();

        if successes.len() < self.settings.quorum_size {
            return Err(BroadcastError::QuorumNotReached {
                required: self.settings.quorum_size,
                achieved: successes.len(),
                successful_providers: successes.into_iter().map(|(pid, _)| pid).collect(),
            });
        }

        let distinct: HashSet<H256> = successes.iter().map(|(_, h)| *h).collect();
        if distinct.len() > 1 {
            self.events.publish(BroadcastEvent::HashMismatch {
                id,
                hashes: distinct.iter().copied().collect(),
            });
            return Err(BroadcastError::ConsensusFailure {
                detail: "providers disagree on the transaction hash".to_string(),
                successful_providers: successes.into_iter().map(|(pid, _)| pid).collect(),
            });
        }

        Ok(successes[0].1)
    }

    /// Divergent hashes in the tolerant modes are surfaced but not fatal
    fn check_hash_agreement(&self, id: Uuid, successes: &[(String, H256)]) {
        let distinct: HashSet<H256> = successes.iter().map(|(_, h)| *h).collect();
        if distinct.len() > 1 {
            let hashes: Vec<H256> = distinct.into_iter().collect();
            warn!(
                broadcast = %id,
                ?hashes,
                "providers returned divergent hashes for one payload"
            );
            self.events.publish(BroadcastEvent::HashMismatch { id, hashes });
        }
    }

    async fn fail(
        &self,
        handle: &Arc<RwLock<BroadcastRecord>>,
        id: Uuid,
        request: &TransactionRequest,
        leased: bool,
        error: &BroadcastError,
    ) {
        let fatal_rejection = matches!(
            error,
            BroadcastError::InsufficientFunds { .. }
                | BroadcastError::NonceTooLow { .. }
                | BroadcastError::Validation(_)
        );

        let (terminal, nonce, accepted) = {
            let mut record = handle.write().await;
            let target = if record.state == BroadcastState::Broadcasting && fatal_rejection {
                BroadcastState::Rejected
            } else {
                BroadcastState::Failed
            };
            if !record.state.is_terminal() {
                let _ = record.transition(target);
            }
            (
                record.state,
                record.nonce,
                !record.successful_providers().is_empty(),
            )
        };

        if matches!(error, BroadcastError::NonceTooLow { .. }) {
            // The nonce is consumed on-chain either way; a receipt re-check
            // tells whether one of our own attempts (this record's or its
            // predecessor's) is what landed.
            let hashes = {
                let record = handle.read().await;
                let mut hashes = record.tx_hashes.clone();
                if let Some(hash) = record.predecessor_hash {
                    if !hashes.contains(&hash) {
                        hashes.push(hash);
                    }
                }
                hashes
            };
            match self.recheck_receipts(request.chain_id, &hashes).await {
                Some(tx_hash) => info!(
                    broadcast = %id,
                    tx_hash = %tx_hash,
                    "nonce consumed by an earlier attempt that already landed"
                ),
                None => warn!(
                    broadcast = %id,
                    "nonce consumed with no receipt for any of our attempts"
                ),
            }
            if let Some(nonce) = nonce {
                self.nonces
                    .complete(request.from, request.chain_id, nonce)
                    .await;
            }
        } else if leased && !accepted {
            // An accepted transaction may still land; its nonce stays reserved
            if let Some(nonce) = nonce {
                self.nonces
                    .release(request.from, request.chain_id, nonce)
                    .await;
            }
        }

        warn!(broadcast = %id, %error, "broadcast failed");
        self.events.publish(BroadcastEvent::Failed {
            id,
            reason: error.to_string(),
        });
        crate::metrics::record_broadcast_outcome(request.chain_id, terminal.as_str());
    }

    /// Poll one provider for a receipt for any of the given hashes
    async fn recheck_receipts(&self, chain_id: u64, hashes: &[H256]) -> Option<H256> {
        let providers = self.registry.select(chain_id, 1);
        let provider = providers.first()?;
        for &tx_hash in hashes {
            provider.limiter.acquire().await;
            let start = Instant::now();
            match provider.endpoint.transaction_receipt(tx_hash).await {
                Ok(Some(_)) => {
                    self.registry.record_success(&provider.id, start.elapsed());
                    return Some(tx_hash);
                }
                Ok(None) => {
                    self.registry.record_success(&provider.id, start.elapsed());
                }
                Err(e) => {
                    self.registry.record_failure(&provider.id, &e.message);
                }
            }
        }
        None
    }
}

fn all_failed(results: Vec<(String, Result<(H256, u64), String>)>) -> BroadcastError {
    let errors: Vec<(String, String)> = results
        .into_iter()
        .filter_map(|(pid, r)| r.err().map(|m| (pid, m)))
        .collect();
    BroadcastError::AllBroadcastsFailed {
        attempts: errors.len() as u32,
        errors,
    }
}

fn build_transaction(request: &TransactionRequest, nonce: u64, fees: GasFees) -> TypedTransaction {
    let gas_limit = request.gas_limit.unwrap_or_else(|| {
        // No estimation here: contract calls are expected to carry a limit
        if request.data.is_some() {
            U256::from(500_000u64)
        } else {
            U256::from(21_000u64)
        }
    });

    match fees {
        GasFees::Legacy { gas_price } => {
            let mut tx = LegacyRequest::new()
                .from(request.from)
                .value(request.value)
                .gas(gas_limit)
                .gas_price(gas_price)
                .nonce(nonce)
                .chain_id(request.chain_id);
            if let Some(to) = request.to {
                tx = tx.to(to);
            }
            if let Some(data) = request.data.clone() {
                tx = tx.data(data);
            }
            TypedTransaction::Legacy(tx)
        }
        GasFees::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let mut tx = Eip1559TransactionRequest::new()
                .from(request.from)
                .value(request.value)
                .gas(gas_limit)
                .nonce(nonce)
                .chain_id(request.chain_id)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas);
            if let Some(to) = request.to {
                tx = tx.to(to);
            }
            if let Some(data) = request.data.clone() {
                tx = tx.data(data);
            }
            TypedTransaction::Eip1559(tx)
        }
    }
}

fn payload_preview(raw: &Bytes) -> String {
    format!("0x{}", hex::encode(&raw[..raw.len().min(8)]))
}
