//! Scriptable test doubles for the capability traits
//!
//! `MockEndpoint` lets tests script per-call behavior (fail N sends then
//! accept, receipt appears on the k-th poll) without any network I/O.

#![allow(dead_code)]

use crate::broadcast::record::TransactionRequest;
use crate::config::{NetworkProfile, ProviderConfig};
use crate::error::BroadcastResult;
use crate::provider::endpoint::{FeeData, RpcEndpoint, RpcError, RpcResult, TxSigner};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TransactionReceipt, H256, U256, U64};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub struct MockEndpoint {
    default_hash: Mutex<H256>,
    send_script: Mutex<VecDeque<Result<H256, String>>>,
    send_delay: Mutex<Option<Duration>>,
    receipt_delay: Mutex<Option<Duration>>,
    sent: Mutex<Vec<Bytes>>,
    receipt_script: Mutex<VecDeque<Option<TransactionReceipt>>>,
    steady_receipt: Mutex<Option<TransactionReceipt>>,
    tx_count: AtomicU64,
    block_number: AtomicU64,
    block_failures: Mutex<VecDeque<String>>,
    fee_data: Mutex<FeeData>,
    balance: Mutex<U256>,
    calls: AtomicUsize,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self {
            default_hash: Mutex::new(H256::from_low_u64_be(0xbeef)),
            send_script: Mutex::new(VecDeque::new()),
            send_delay: Mutex::new(None),
            receipt_delay: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            receipt_script: Mutex::new(VecDeque::new()),
            steady_receipt: Mutex::new(None),
            tx_count: AtomicU64::new(0),
            block_number: AtomicU64::new(1),
            block_failures: Mutex::new(VecDeque::new()),
            fee_data: Mutex::new(FeeData {
                gas_price: Some(gwei(10)),
                max_fee_per_gas: Some(gwei(20)),
                max_priority_fee_per_gas: Some(gwei(2)),
            }),
            balance: Mutex::new(U256::from(10).pow(U256::from(18))),
            calls: AtomicUsize::new(0),
        }
    }

    /// Hash returned by sends once the script is exhausted
    pub fn with_hash(self, hash: H256) -> Self {
        *self.default_hash.lock().unwrap() = hash;
        self
    }

    pub fn set_default_hash(&self, hash: H256) {
        *self.default_hash.lock().unwrap() = hash;
    }

    /// Queue an explicit outcome for the next send
    pub fn push_send_result(&self, result: Result<H256, &str>) {
        self.send_script
            .lock()
            .unwrap()
            .push_back(result.map_err(|e| e.to_string()));
    }

    /// Fail the next `n` sends with the given provider error text
    pub fn fail_sends(&self, message: &str, n: usize) {
        let mut script = self.send_script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Err(message.to_string()));
        }
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_receipt_delay(&self, delay: Duration) {
        *self.receipt_delay.lock().unwrap() = Some(delay);
    }

    /// Receipt returned on the next poll only
    pub fn push_receipt(&self, receipt: Option<TransactionReceipt>) {
        self.receipt_script.lock().unwrap().push_back(receipt);
    }

    /// Receipt returned on every poll once the script is exhausted
    pub fn set_receipt(&self, receipt: TransactionReceipt) {
        *self.steady_receipt.lock().unwrap() = Some(receipt);
    }

    pub fn set_tx_count(&self, count: u64) {
        self.tx_count.store(count, Ordering::SeqCst);
    }

    pub fn set_block_number(&self, block: u64) {
        self.block_number.store(block, Ordering::SeqCst);
    }

    pub fn fail_next_block_queries(&self, message: &str, n: usize) {
        let mut failures = self.block_failures.lock().unwrap();
        for _ in 0..n {
            failures.push_back(message.to_string());
        }
    }

    pub fn set_fee_data(&self, fee_data: FeeData) {
        *self.fee_data.lock().unwrap() = fee_data;
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Default for MockEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcEndpoint for MockEndpoint {
    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.sent.lock().unwrap().push(raw);

        let scripted = self.send_script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(hash)) => Ok(hash),
            Some(Err(message)) => Err(RpcError { message }),
            None => Ok(*self.default_hash.lock().unwrap()),
        }
    }

    async fn transaction_receipt(&self, _tx_hash: H256) -> RpcResult<Option<TransactionReceipt>> {
        let delay = *self.receipt_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.receipt_script.lock().unwrap().pop_front();
        match scripted {
            Some(receipt) => Ok(receipt),
            None => Ok(self.steady_receipt.lock().unwrap().clone()),
        }
    }

    async fn transaction_count(&self, _address: Address) -> RpcResult<u64> {
        Ok(self.tx_count.load(Ordering::SeqCst))
    }

    async fn fee_data(&self) -> RpcResult<FeeData> {
        Ok(self.fee_data.lock().unwrap().clone())
    }

    async fn block_number(&self) -> RpcResult<u64> {
        if let Some(message) = self.block_failures.lock().unwrap().pop_front() {
            return Err(RpcError { message });
        }
        Ok(self.block_number.load(Ordering::SeqCst))
    }

    async fn balance(&self, _address: Address) -> RpcResult<U256> {
        Ok(*self.balance.lock().unwrap())
    }
}

pub struct MockSigner {
    address: Address,
    signed: AtomicUsize,
}

impl MockSigner {
    pub fn new() -> Self {
        Self {
            address: Address::from_low_u64_be(0xa11ce),
            signed: AtomicUsize::new(0),
        }
    }

    pub fn signed_count(&self) -> usize {
        self.signed.load(Ordering::SeqCst)
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxSigner for MockSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign_transaction(&self, _tx: &TypedTransaction) -> BroadcastResult<Bytes> {
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]))
    }
}

pub fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

pub fn receipt(tx_hash: H256, block_number: u64, status: u64) -> TransactionReceipt {
    TransactionReceipt {
        transaction_hash: tx_hash,
        block_number: Some(U64::from(block_number)),
        status: Some(U64::from(status)),
        gas_used: Some(U256::from(21_000)),
        ..Default::default()
    }
}

pub fn test_profile(chain_id: u64) -> NetworkProfile {
    NetworkProfile {
        chain_id,
        name: format!("testnet-{}", chain_id),
        providers: vec![ProviderConfig {
            id: "test".to_string(),
            url: "http://localhost:8545".to_string(),
            weight: 1,
            tier: 0,
        }],
        required_confirmations: 1,
        timeout_secs: 60,
        min_gas_price_gwei: 1,
        max_gas_price_gwei: 100,
        gas_inflation_percent: 125,
        fee_safety_percent: 110,
        eip1559: false,
        block_time_ms: 1000,
        enabled: true,
    }
}

pub fn test_request(chain_id: u64) -> TransactionRequest {
    TransactionRequest {
        chain_id,
        from: Address::from_low_u64_be(0xa11ce),
        to: Some(Address::from_low_u64_be(0xb0b)),
        value: U256::from(1_000_000u64),
        data: None,
        gas_limit: Some(U256::from(21_000)),
        fee_override: None,
        nonce: None,
        priority: 5,
    }
}
