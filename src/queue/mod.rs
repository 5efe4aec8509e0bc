//! Bounded broadcast queue
//!
//! Pure in-memory state: schema validation on enqueue, configurable overflow
//! policy, optional priority ordering (stable within a priority level), and
//! instrumentation hooks around enqueue/dequeue. No network I/O happens here.

use crate::broadcast::record::TransactionRequest;
use crate::config::OverflowPolicy;
use crate::error::{BroadcastError, BroadcastResult};
use crate::events::{BroadcastEvent, EventBus};

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A queued request awaiting dispatch
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: Uuid,
    pub request: TransactionRequest,
    pub enqueued_at: DateTime<Utc>,
    /// Arrival order, used to keep priority ordering stable
    pub sequence: u64,
}

/// Result of an enqueue attempt that did not error
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    /// False when `drop-newest` refused the item
    pub accepted: bool,
    pub depth: usize,
    /// Entry evicted by `drop-oldest`, if any
    pub evicted: Option<Uuid>,
}

/// Schema limits applied to every enqueued request
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub known_chains: Vec<u64>,
    pub max_priority: u8,
    pub max_gas_limit: U256,
    pub max_data_bytes: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            known_chains: Vec::new(),
            max_priority: 10,
            max_gas_limit: U256::from(30_000_000u64),
            max_data_bytes: 128 * 1024,
        }
    }
}

impl ValidationRules {
    pub fn validate(&self, request: &TransactionRequest) -> BroadcastResult<()> {
        if !self.known_chains.is_empty() && !self.known_chains.contains(&request.chain_id) {
            return Err(BroadcastError::ChainNotFound {
                chain_id: request.chain_id,
            });
        }
        if request.from.is_zero() {
            return Err(BroadcastError::Validation(
                "sender address must not be zero".to_string(),
            ));
        }
        if request.to.is_none() && request.data.is_none() {
            return Err(BroadcastError::Validation(
                "request needs a recipient or contract-creation data".to_string(),
            ));
        }
        if request.priority > self.max_priority {
            return Err(BroadcastError::Validation(format!(
                "priority {} exceeds maximum {}",
                request.priority, self.max_priority
            )));
        }
        if let Some(gas_limit) = request.gas_limit {
            if gas_limit.is_zero() || gas_limit > self.max_gas_limit {
                return Err(BroadcastError::Validation(format!(
                    "gas limit {} outside 1..={}",
                    gas_limit, self.max_gas_limit
                )));
            }
        }
        if let Some(ref data) = request.data {
            if data.len() > self.max_data_bytes {
                return Err(BroadcastError::Validation(format!(
                    "calldata of {} bytes exceeds {} byte limit",
                    data.len(),
                    self.max_data_bytes
                )));
            }
        }
        Ok(())
    }
}

/// Before/after instrumentation around queue operations
pub trait QueueInstrumentation: Send + Sync {
    fn before_enqueue(&self, _request: &TransactionRequest) {}
    fn after_enqueue(&self, _id: Uuid, _depth: usize) {}
    fn before_dequeue(&self) {}
    fn after_dequeue(&self, _entry: Option<&QueueEntry>, _depth: usize) {}
}

/// Default hooks: queue-depth and overflow metrics
pub struct MetricsInstrumentation;

impl QueueInstrumentation for MetricsInstrumentation {
    fn after_enqueue(&self, _id: Uuid, depth: usize) {
        crate::metrics::record_queue_depth(depth);
    }

    fn after_dequeue(&self, _entry: Option<&QueueEntry>, depth: usize) {
        crate::metrics::record_queue_depth(depth);
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    next_sequence: u64,
    total_enqueued: u64,
    total_dequeued: u64,
    total_dropped: u64,
}

/// Queue statistics for the observability surface
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
    pub total_dropped: u64,
}

/// Bounded FIFO / priority queue of pending broadcasts
pub struct BroadcastQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
    priority_enabled: bool,
    rules: ValidationRules,
    hooks: Arc<dyn QueueInstrumentation>,
    events: EventBus,
}

impl BroadcastQueue {
    pub fn new(
        capacity: usize,
        policy: OverflowPolicy,
        priority_enabled: bool,
        rules: ValidationRules,
        hooks: Arc<dyn QueueInstrumentation>,
        events: EventBus,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
            policy,
            priority_enabled,
            rules,
            hooks,
            events,
        }
    }

    /// Validate and enqueue; id assignment happens before the capacity check
    /// so `drop-oldest` evictions can be reported against a stable id.
    pub fn enqueue(&self, id: Uuid, request: TransactionRequest) -> BroadcastResult<EnqueueOutcome> {
        self.rules.validate(&request)?;
        self.hooks.before_enqueue(&request);

        let outcome = {
            let mut state = self.state.lock().unwrap();

            let mut evicted = None;
            if state.entries.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::Reject => {
                        return Err(BroadcastError::QueueFull {
                            capacity: self.capacity,
                        });
                    }
                    OverflowPolicy::DropOldest => {
                        evicted = state.entries.pop_front().map(|e| e.id);
                        state.total_dropped += 1;
                    }
                    OverflowPolicy::DropNewest => {
                        state.total_dropped += 1;
                        return Ok(EnqueueOutcome {
                            accepted: false,
                            depth: state.entries.len(),
                            evicted: None,
                        });
                    }
                }
            }

            let entry = QueueEntry {
                id,
                request,
                enqueued_at: Utc::now(),
                sequence: state.next_sequence,
            };
            state.next_sequence += 1;
            state.total_enqueued += 1;

            if self.priority_enabled {
                // Descending priority, stable within a level by arrival order
                let position = state
                    .entries
                    .iter()
                    .position(|e| e.request.priority < entry.request.priority)
                    .unwrap_or(state.entries.len());
                state.entries.insert(position, entry);
            } else {
                state.entries.push_back(entry);
            }

            EnqueueOutcome {
                accepted: true,
                depth: state.entries.len(),
                evicted,
            }
        };

        if let Some(dropped) = outcome.evicted {
            self.events.publish(BroadcastEvent::QueueOverflow {
                dropped: Some(dropped),
                policy: "drop-oldest".to_string(),
            });
        }
        self.hooks.after_enqueue(id, outcome.depth);
        Ok(outcome)
    }

    /// Emit the overflow notice for a `drop-newest` refusal
    pub fn notice_refused(&self) {
        self.events.publish(BroadcastEvent::QueueOverflow {
            dropped: None,
            policy: "drop-newest".to_string(),
        });
    }

    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.hooks.before_dequeue();
        let (entry, depth) = {
            let mut state = self.state.lock().unwrap();
            let entry = state.entries.pop_front();
            if entry.is_some() {
                state.total_dequeued += 1;
            }
            (entry, state.entries.len())
        };
        self.hooks.after_dequeue(entry.as_ref(), depth);
        entry
    }

    pub fn peek(&self) -> Option<QueueEntry> {
        self.state.lock().unwrap().entries.front().cloned()
    }

    pub fn remove_by_id(&self, id: &Uuid) -> Option<QueueEntry> {
        let mut state = self.state.lock().unwrap();
        let position = state.entries.iter().position(|e| e.id == *id)?;
        state.entries.remove(position)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn utilization(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap();
        QueueStats {
            depth: state.entries.len(),
            capacity: self.capacity,
            utilization: state.entries.len() as f64 / self.capacity as f64,
            total_enqueued: state.total_enqueued,
            total_dequeued: state.total_dequeued,
            total_dropped: state.total_dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_request;

    struct Noop;
    impl QueueInstrumentation for Noop {}

    fn queue(capacity: usize, policy: OverflowPolicy, priority: bool) -> BroadcastQueue {
        BroadcastQueue::new(
            capacity,
            policy,
            priority,
            ValidationRules::default(),
            Arc::new(Noop),
            EventBus::new(64),
        )
    }

    fn request_with_priority(priority: u8) -> TransactionRequest {
        let mut r = test_request(1);
        r.priority = priority;
        r
    }

    #[test]
    fn fifo_order_without_priority() {
        let q = queue(10, OverflowPolicy::Reject, false);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.enqueue(*id, test_request(1)).unwrap();
        }
        for id in &ids {
            assert_eq!(q.dequeue().unwrap().id, *id);
        }
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn reject_policy_leaves_size_unchanged() {
        let q = queue(2, OverflowPolicy::Reject, false);
        q.enqueue(Uuid::new_v4(), test_request(1)).unwrap();
        q.enqueue(Uuid::new_v4(), test_request(1)).unwrap();

        let err = q.enqueue(Uuid::new_v4(), test_request(1)).unwrap_err();
        assert!(matches!(err, BroadcastError::QueueFull { capacity: 2 }));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn drop_oldest_evicts_head_and_keeps_size() {
        let q = queue(2, OverflowPolicy::DropOldest, false);
        let first = Uuid::new_v4();
        q.enqueue(first, test_request(1)).unwrap();
        q.enqueue(Uuid::new_v4(), test_request(1)).unwrap();

        let newest = Uuid::new_v4();
        let outcome = q.enqueue(newest, test_request(1)).unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.evicted, Some(first));
        assert_eq!(q.len(), 2);

        // The evicted head is gone; the newest item is at the tail
        assert_ne!(q.peek().unwrap().id, first);
    }

    #[test]
    fn drop_newest_refuses_the_new_item() {
        let q = queue(1, OverflowPolicy::DropNewest, false);
        let kept = Uuid::new_v4();
        q.enqueue(kept, test_request(1)).unwrap();

        let outcome = q.enqueue(Uuid::new_v4(), test_request(1)).unwrap();
        assert!(!outcome.accepted);
        assert_eq!(q.len(), 1);
        assert_eq!(q.peek().unwrap().id, kept);
    }

    #[test]
    fn priority_order_is_stable_within_a_level() {
        let q = queue(10, OverflowPolicy::Reject, true);
        let low = Uuid::new_v4();
        let high_a = Uuid::new_v4();
        let high_b = Uuid::new_v4();

        q.enqueue(low, request_with_priority(1)).unwrap();
        q.enqueue(high_a, request_with_priority(8)).unwrap();
        q.enqueue(high_b, request_with_priority(8)).unwrap();

        assert_eq!(q.dequeue().unwrap().id, high_a);
        assert_eq!(q.dequeue().unwrap().id, high_b);
        assert_eq!(q.dequeue().unwrap().id, low);
    }

    #[test]
    fn remove_by_id_pulls_from_the_middle() {
        let q = queue(10, OverflowPolicy::Reject, false);
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            q.enqueue(*id, test_request(1)).unwrap();
        }

        assert!(q.remove_by_id(&ids[1]).is_some());
        assert!(q.remove_by_id(&ids[1]).is_none());
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue().unwrap().id, ids[0]);
        assert_eq!(q.dequeue().unwrap().id, ids[2]);
    }

    #[test]
    fn validation_rejects_bad_requests() {
        let q = BroadcastQueue::new(
            10,
            OverflowPolicy::Reject,
            false,
            ValidationRules {
                known_chains: vec![1],
                ..Default::default()
            },
            Arc::new(Noop),
            EventBus::new(4),
        );

        let err = q.enqueue(Uuid::new_v4(), test_request(999)).unwrap_err();
        assert!(matches!(err, BroadcastError::ChainNotFound { chain_id: 999 }));

        let mut no_target = test_request(1);
        no_target.to = None;
        no_target.data = None;
        assert!(matches!(
            q.enqueue(Uuid::new_v4(), no_target).unwrap_err(),
            BroadcastError::Validation(_)
        ));

        let mut over_priority = test_request(1);
        over_priority.priority = 11;
        assert!(matches!(
            q.enqueue(Uuid::new_v4(), over_priority).unwrap_err(),
            BroadcastError::Validation(_)
        ));

        assert_eq!(q.len(), 0);
    }

    #[test]
    fn stats_track_totals() {
        let q = queue(2, OverflowPolicy::DropOldest, false);
        for _ in 0..3 {
            q.enqueue(Uuid::new_v4(), test_request(1)).unwrap();
        }
        q.dequeue();

        let stats = q.stats();
        assert_eq!(stats.depth, 1);
        assert_eq!(stats.capacity, 2);
        assert_eq!(stats.total_enqueued, 3);
        assert_eq!(stats.total_dequeued, 1);
        assert_eq!(stats.total_dropped, 1);
        assert!((stats.utilization - 0.5).abs() < f64::EPSILON);
    }
}
