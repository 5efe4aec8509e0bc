//! Lifecycle events
//!
//! Typed events fanned out over a `tokio::sync::broadcast` channel. Consumers
//! (monitor, API websockets, telemetry) subscribe independently; ordering is
//! only guaranteed per publisher, never across subsystems.

use ethers::types::H256;
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::provider::health::HealthStatus;

/// Events emitted across the broadcast lifecycle
#[derive(Debug, Clone, Serialize)]
pub enum BroadcastEvent {
    /// Request accepted into the queue
    Enqueued { id: Uuid, chain_id: u64 },

    /// An entry was dropped (or refused) because the queue was full
    QueueOverflow { dropped: Option<Uuid>, policy: String },

    /// Nonce leased and fees resolved, about to sign
    Prepared { id: Uuid, nonce: u64 },

    /// At least one provider accepted the raw transaction
    Sent {
        id: Uuid,
        tx_hash: H256,
        provider_id: String,
    },

    /// Providers that accepted the same broadcast disagree on its hash
    HashMismatch { id: Uuid, hashes: Vec<H256> },

    /// Required confirmations reached
    Confirmed {
        id: Uuid,
        tx_hash: H256,
        block_number: u64,
        confirmations: u64,
    },

    /// Terminal failure (all providers exhausted, on-chain revert, or
    /// retries exhausted)
    Failed { id: Uuid, reason: String },

    /// Confirmation window elapsed before a receipt appeared
    TimedOut { id: Uuid },

    /// Caller cancelled local tracking of a pending broadcast
    Cancelled { id: Uuid },

    /// A failed broadcast was re-enqueued with escalated gas
    RetryScheduled {
        id: Uuid,
        predecessor: Uuid,
        attempt: u32,
    },

    /// A provider moved between health states
    ProviderHealthChanged {
        provider_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
}

impl BroadcastEvent {
    /// Event name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            BroadcastEvent::Enqueued { .. } => "broadcast:enqueued",
            BroadcastEvent::QueueOverflow { .. } => "queue:overflow",
            BroadcastEvent::Prepared { .. } => "broadcast:prepared",
            BroadcastEvent::Sent { .. } => "broadcast:sent",
            BroadcastEvent::HashMismatch { .. } => "broadcast:hash-mismatch",
            BroadcastEvent::Confirmed { .. } => "broadcast:confirmed",
            BroadcastEvent::Failed { .. } => "broadcast:failed",
            BroadcastEvent::TimedOut { .. } => "broadcast:timeout",
            BroadcastEvent::Cancelled { .. } => "broadcast:cancelled",
            BroadcastEvent::RetryScheduled { .. } => "broadcast:retry-scheduled",
            BroadcastEvent::ProviderHealthChanged { .. } => "provider:health-changed",
        }
    }
}

/// Broadcast-channel event bus
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event; lagging or absent subscribers are not an error
    pub fn publish(&self, event: BroadcastEvent) {
        tracing::debug!(event = event.name(), "event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
