//! Broadcast records and their state machine
//!
//! A `BroadcastRecord` is the unit of work tracked end to end. Transitions go
//! through `transition()`, which enforces the allowed-edge table: terminal
//! states are immutable, and the only way "back" is a brand-new record
//! carrying a `predecessor` link.

use crate::config::StrategyMode;
use crate::error::{BroadcastError, BroadcastResult};
use crate::tx::gas::GasFees;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A transaction the caller wants broadcast. Immutable once queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub chain_id: u64,
    pub from: Address,
    pub to: Option<Address>,
    #[serde(default)]
    pub value: U256,
    pub data: Option<Bytes>,
    pub gas_limit: Option<U256>,
    /// Caller-supplied fees win over network fee resolution
    pub fee_override: Option<GasFees>,
    pub nonce: Option<u64>,
    /// 0-10, higher dequeues first when priority mode is on
    #[serde(default)]
    pub priority: u8,
}

/// Broadcast lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastState {
    Preparing,
    Validating,
    Broadcasting,
    Pending,
    Confirmed,
    Failed,
    Rejected,
    TimedOut,
    Cancelled,
}

impl BroadcastState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BroadcastState::Confirmed
                | BroadcastState::Failed
                | BroadcastState::Rejected
                | BroadcastState::TimedOut
                | BroadcastState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastState::Preparing => "preparing",
            BroadcastState::Validating => "validating",
            BroadcastState::Broadcasting => "broadcasting",
            BroadcastState::Pending => "pending",
            BroadcastState::Confirmed => "confirmed",
            BroadcastState::Failed => "failed",
            BroadcastState::Rejected => "rejected",
            BroadcastState::TimedOut => "timeout",
            BroadcastState::Cancelled => "cancelled",
        }
    }

    /// Allowed-edge table for the state machine
    fn can_transition(from: BroadcastState, to: BroadcastState) -> bool {
        use BroadcastState::*;
        matches!(
            (from, to),
            (Preparing, Validating)
                | (Preparing, Cancelled)
                | (Preparing, Failed)
                | (Validating, Broadcasting)
                | (Validating, Failed)
                | (Broadcasting, Pending)
                | (Broadcasting, Failed)
                | (Broadcasting, Rejected)
                | (Pending, Confirmed)
                | (Pending, Rejected)
                | (Pending, Failed)
                | (Pending, TimedOut)
                | (Pending, Cancelled)
        )
    }
}

/// Outcome of one provider attempt within a broadcast
#[derive(Debug, Clone, Serialize)]
pub struct ProviderOutcome {
    pub provider_id: String,
    pub tx_hash: Option<H256>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub at: DateTime<Utc>,
}

impl ProviderOutcome {
    pub fn success(provider_id: &str, tx_hash: H256, latency_ms: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            tx_hash: Some(tx_hash),
            error: None,
            latency_ms,
            at: Utc::now(),
        }
    }

    pub fn failure(provider_id: &str, error: &str, latency_ms: u64) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            tx_hash: None,
            error: Some(error.to_string()),
            latency_ms,
            at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.tx_hash.is_some()
    }
}

/// The tracked unit of work
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastRecord {
    pub id: Uuid,
    pub request: TransactionRequest,
    pub mode: StrategyMode,
    pub state: BroadcastState,
    pub nonce: Option<u64>,
    pub fees: Option<GasFees>,
    /// Retry generation: 1 for the first record, predecessor chain counts up
    pub attempt: u32,
    pub outcomes: Vec<ProviderOutcome>,
    pub tx_hashes: Vec<H256>,
    pub confirmations: u64,
    pub predecessor: Option<Uuid>,
    /// Primary hash of the predecessor, for receipt re-checks when a retry
    /// hits nonce-too-low
    pub predecessor_hash: Option<H256>,
    pub errors: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BroadcastRecord {
    pub fn new(id: Uuid, request: TransactionRequest, mode: StrategyMode) -> Self {
        Self {
            id,
            request,
            mode,
            state: BroadcastState::Preparing,
            nonce: None,
            fees: None,
            attempt: 1,
            outcomes: Vec::new(),
            tx_hashes: Vec::new(),
            confirmations: 0,
            predecessor: None,
            predecessor_hash: None,
            errors: Vec::new(),
            created_at: Utc::now(),
            broadcast_at: None,
            completed_at: None,
        }
    }

    /// Successor record for a retry: same request, escalated fee override is
    /// applied by the retry manager, state machine starts over.
    pub fn successor(&self, request: TransactionRequest, mode: StrategyMode) -> Self {
        let mut record = Self::new(Uuid::new_v4(), request, mode);
        record.attempt = self.attempt + 1;
        record.predecessor = Some(self.id);
        record.predecessor_hash = self.primary_hash();
        record
    }

    /// Move to `to`, enforcing the allowed-edge table
    pub fn transition(&mut self, to: BroadcastState) -> BroadcastResult<()> {
        if !BroadcastState::can_transition(self.state, to) {
            return Err(BroadcastError::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.state = to;
        match to {
            BroadcastState::Pending => self.broadcast_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        crate::metrics::record_state_transition(self.request.chain_id, to.as_str());
        Ok(())
    }

    pub fn record_outcome(&mut self, outcome: ProviderOutcome) {
        if let Some(hash) = outcome.tx_hash {
            if !self.tx_hashes.contains(&hash) {
                self.tx_hashes.push(hash);
            }
        }
        if let Some(ref error) = outcome.error {
            self.errors
                .push(format!("{}: {}", outcome.provider_id, error));
        }
        self.outcomes.push(outcome);
    }

    /// The hash to monitor: the one most providers reported
    pub fn primary_hash(&self) -> Option<H256> {
        let mut best: Option<(H256, usize)> = None;
        for hash in &self.tx_hashes {
            let count = self
                .outcomes
                .iter()
                .filter(|o| o.tx_hash == Some(*hash))
                .count();
            if best.map(|(_, c)| count > c).unwrap_or(true) {
                best = Some((*hash, count));
            }
        }
        best.map(|(h, _)| h)
    }

    pub fn successful_providers(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.provider_id.clone())
            .collect()
    }
}

/// Active records plus a bounded ring of terminal history
pub struct RecordStore {
    active: DashMap<Uuid, Arc<RwLock<BroadcastRecord>>>,
    history: Mutex<VecDeque<BroadcastRecord>>,
    history_capacity: usize,
}

impl RecordStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            active: DashMap::new(),
            history: Mutex::new(VecDeque::new()),
            history_capacity,
        }
    }

    pub fn insert(&self, record: BroadcastRecord) -> Arc<RwLock<BroadcastRecord>> {
        let id = record.id;
        let handle = Arc::new(RwLock::new(record));
        self.active.insert(id, handle.clone());
        handle
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<RwLock<BroadcastRecord>>> {
        self.active.get(id).map(|r| r.clone())
    }

    /// Snapshot of an active or historical record
    pub async fn snapshot(&self, id: &Uuid) -> Option<BroadcastRecord> {
        if let Some(handle) = self.get(id) {
            return Some(handle.read().await.clone());
        }
        self.history
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == *id)
            .cloned()
    }

    /// All active records currently in the given state
    pub async fn in_state(&self, state: BroadcastState) -> Vec<Arc<RwLock<BroadcastRecord>>> {
        let handles: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        let mut matching = Vec::new();
        for handle in handles {
            if handle.read().await.state == state {
                matching.push(handle);
            }
        }
        matching
    }

    /// Drop a terminal record from active tracking, appending it to history
    pub async fn evict(&self, id: &Uuid) {
        if let Some((_, handle)) = self.active.remove(id) {
            let record = handle.read().await.clone();
            debug_assert!(record.state.is_terminal());
            let mut history = self.history.lock().unwrap();
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(record);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}
