//! Retry planning for failed and stuck broadcasts
//!
//! A retry is never an in-place mutation: the planner produces a successor
//! record linked through `predecessor`, optionally with escalated fees. The
//! service owns re-insertion and scheduling; the planner only decides.

use crate::broadcast::record::BroadcastRecord;
use crate::config::NetworkProfile;
use crate::error::BroadcastError;
use crate::events::{BroadcastEvent, EventBus};
use crate::tx::gas;

use std::time::Duration;
use tracing::{debug, info};

/// A scheduled successor broadcast
pub struct RetryPlan {
    pub record: BroadcastRecord,
    pub delay: Duration,
}

/// Decides whether a failed broadcast gets a successor
pub trait RetryManager: Send + Sync {
    fn plan(
        &self,
        record: &BroadcastRecord,
        error: &BroadcastError,
        profile: &NetworkProfile,
    ) -> Option<RetryPlan>;
}

/// Default policy: retry transient failures up to the attempt budget,
/// escalating fees when the mempool called the transaction underpriced, and
/// replacing stuck transactions on their original nonce.
pub struct GasEscalatingRetry {
    max_retries: u32,
    retry_delay: Duration,
    events: EventBus,
}

impl GasEscalatingRetry {
    pub fn new(max_retries: u32, retry_delay: Duration, events: EventBus) -> Self {
        Self {
            max_retries,
            retry_delay,
            events,
        }
    }
}

impl RetryManager for GasEscalatingRetry {
    fn plan(
        &self,
        record: &BroadcastRecord,
        error: &BroadcastError,
        profile: &NetworkProfile,
    ) -> Option<RetryPlan> {
        if !error.is_retryable() && !matches!(error, BroadcastError::Timeout { .. }) {
            debug!(broadcast = %record.id, %error, "not retryable");
            return None;
        }
        // attempt counts generations: the first record is attempt 1
        if record.attempt > self.max_retries {
            info!(
                broadcast = %record.id,
                attempt = record.attempt,
                "retry budget exhausted"
            );
            return None;
        }

        let mut request = record.request.clone();
        let accepted = !record.successful_providers().is_empty();

        // An accepted-but-stuck transaction must be replaced on its own
        // nonce, and a replacement is only valid with a higher price.
        let escalate = error.needs_gas_escalation() || accepted;
        if accepted {
            request.nonce = record.nonce;
        }
        if escalate {
            if let Some(fees) = record.fees {
                request.fee_override = Some(gas::escalate(fees, profile));
            }
        }

        let successor = record.successor(request, record.mode);
        info!(
            broadcast = %successor.id,
            predecessor = %record.id,
            attempt = successor.attempt,
            escalated = escalate,
            "retry scheduled"
        );
        self.events.publish(BroadcastEvent::RetryScheduled {
            id: successor.id,
            predecessor: record.id,
            attempt: successor.attempt,
        });
        crate::metrics::record_retry(record.request.chain_id);

        Some(RetryPlan {
            record: successor,
            delay: self.retry_delay,
        })
    }
}
