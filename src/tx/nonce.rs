//! Nonce management for reliable transaction submission
//!
//! Per (address, chain) allocator: the network's pending count seeds a local
//! counter once, after which leases are purely local. Released nonces are
//! handed out again (smallest first) before the counter advances, so a failed
//! attempt never leaves a gap. Each key has its own lock; unrelated accounts
//! never contend.

use crate::error::{BroadcastError, BroadcastResult};
use crate::provider::endpoint::RpcEndpoint;

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

type Key = (Address, u64);

/// Per-account nonce state
#[derive(Debug, Default)]
struct AccountNonceState {
    /// Next fresh nonce to hand out
    next: u64,
    /// Leased, not yet completed or released
    in_flight: BTreeSet<u64>,
    /// Released below `next`, reusable before the counter advances
    released: BTreeSet<u64>,
    /// Whether `next` has been seeded from the network
    synced: bool,
}

/// Manages nonces across accounts and chains
pub struct NonceManager {
    accounts: DashMap<Key, Arc<Mutex<AccountNonceState>>>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
        }
    }

    fn state(&self, address: Address, chain_id: u64) -> Arc<Mutex<AccountNonceState>> {
        self.accounts
            .entry((address, chain_id))
            .or_insert_with(|| Arc::new(Mutex::new(AccountNonceState::default())))
            .clone()
    }

    /// Lease the next nonce for an account. The first lease per key (or after
    /// a reset) reads the network's pending count; every later lease is local.
    pub async fn lease(
        &self,
        address: Address,
        chain_id: u64,
        endpoint: &dyn RpcEndpoint,
    ) -> BroadcastResult<u64> {
        let cell = self.state(address, chain_id);
        let mut state = cell.lock().await;

        if !state.synced {
            let network = endpoint
                .transaction_count(address)
                .await
                .map_err(|e| BroadcastError::Network {
                    provider_id: "nonce-sync".to_string(),
                    message: e.message,
                })?;
            state.next = state.next.max(network);
            state.synced = true;
            debug!(?address, chain_id, nonce = state.next, "nonce state seeded");
        }

        let nonce = match state.released.iter().next().copied() {
            Some(reused) => {
                state.released.remove(&reused);
                reused
            }
            None => {
                let fresh = state.next;
                state.next += 1;
                fresh
            }
        };

        state.in_flight.insert(nonce);
        crate::metrics::record_nonce_in_flight(chain_id, state.in_flight.len());
        debug!(?address, chain_id, nonce, "nonce leased");
        Ok(nonce)
    }

    /// Release a lease whose broadcast definitively failed before any
    /// provider accepted it; the nonce becomes reusable by the next lease.
    pub async fn release(&self, address: Address, chain_id: u64, nonce: u64) {
        let cell = self.state(address, chain_id);
        let mut state = cell.lock().await;
        if state.in_flight.remove(&nonce) {
            state.released.insert(nonce);
            crate::metrics::record_nonce_in_flight(chain_id, state.in_flight.len());
            debug!(?address, chain_id, nonce, "nonce released");
        }
    }

    /// Permanently consume a lease whose transaction confirmed
    pub async fn complete(&self, address: Address, chain_id: u64, nonce: u64) {
        let cell = self.state(address, chain_id);
        let mut state = cell.lock().await;
        state.in_flight.remove(&nonce);
        crate::metrics::record_nonce_in_flight(chain_id, state.in_flight.len());
    }

    /// Re-seed from the network view, clearing state the chain has moved past
    pub async fn sync(
        &self,
        address: Address,
        chain_id: u64,
        endpoint: &dyn RpcEndpoint,
    ) -> BroadcastResult<()> {
        let cell = self.state(address, chain_id);
        let mut state = cell.lock().await;

        let network = endpoint
            .transaction_count(address)
            .await
            .map_err(|e| BroadcastError::Network {
                provider_id: "nonce-sync".to_string(),
                message: e.message,
            })?;

        if network > state.next {
            warn!(
                ?address,
                chain_id,
                local = state.next,
                network,
                "nonce gap: network ahead of local counter"
            );
        }

        state.next = state.next.max(network);
        state.in_flight.retain(|n| *n >= network);
        state.released.retain(|n| *n >= network);
        state.synced = true;
        crate::metrics::record_nonce_in_flight(chain_id, state.in_flight.len());
        Ok(())
    }

    /// Drop all local state for an account (next lease re-reads the network)
    pub async fn reset(&self, address: Address, chain_id: u64) {
        self.accounts.remove(&(address, chain_id));
    }

    pub async fn in_flight(&self, address: Address, chain_id: u64) -> usize {
        let cell = self.state(address, chain_id);
        let state = cell.lock().await;
        state.in_flight.len()
    }
}

impl Default for NonceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEndpoint;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[tokio::test]
    async fn seeds_from_network_then_counts_locally() {
        let manager = NonceManager::new();
        let endpoint = MockEndpoint::new();
        endpoint.set_tx_count(7);

        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 7);

        // A stale network view after seeding must not roll the counter back
        endpoint.set_tx_count(0);
        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 8);
        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 9);
        assert_eq!(manager.in_flight(addr(1), 1).await, 3);
    }

    #[tokio::test]
    async fn concurrent_leases_are_distinct_and_increasing() {
        let manager = Arc::new(NonceManager::new());
        let endpoint = Arc::new(MockEndpoint::new());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = manager.clone();
            let endpoint = endpoint.clone();
            handles.push(tokio::spawn(async move {
                manager.lease(addr(1), 1, endpoint.as_ref()).await.unwrap()
            }));
        }

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();
        let expected: Vec<u64> = (0..20).collect();
        assert_eq!(nonces, expected);
    }

    #[tokio::test]
    async fn released_nonce_is_reused_before_advancing() {
        let manager = NonceManager::new();
        let endpoint = MockEndpoint::new();

        let a = manager.lease(addr(1), 1, &endpoint).await.unwrap();
        let b = manager.lease(addr(1), 1, &endpoint).await.unwrap();
        assert_eq!((a, b), (0, 1));

        manager.release(addr(1), 1, a).await;
        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), a);
        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn accounts_and_chains_are_independent() {
        let manager = NonceManager::new();
        let endpoint = MockEndpoint::new();
        endpoint.set_tx_count(5);

        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 5);

        endpoint.set_tx_count(0);
        assert_eq!(manager.lease(addr(2), 1, &endpoint).await.unwrap(), 0);
        assert_eq!(manager.lease(addr(1), 137, &endpoint).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sync_clears_state_the_chain_moved_past() {
        let manager = NonceManager::new();
        let endpoint = MockEndpoint::new();

        let a = manager.lease(addr(1), 1, &endpoint).await.unwrap();
        let _b = manager.lease(addr(1), 1, &endpoint).await.unwrap();
        manager.release(addr(1), 1, a).await;

        // Another wallet instance used nonces 0..4 on chain
        endpoint.set_tx_count(5);
        manager.sync(addr(1), 1, &endpoint).await.unwrap();

        assert_eq!(manager.in_flight(addr(1), 1).await, 0);
        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn complete_consumes_without_reuse() {
        let manager = NonceManager::new();
        let endpoint = MockEndpoint::new();

        let a = manager.lease(addr(1), 1, &endpoint).await.unwrap();
        manager.complete(addr(1), 1, a).await;
        assert_eq!(manager.in_flight(addr(1), 1).await, 0);
        assert_eq!(manager.lease(addr(1), 1, &endpoint).await.unwrap(), 1);
    }
}
