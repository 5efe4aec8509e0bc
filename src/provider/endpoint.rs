//! Consumed capabilities: RPC endpoints and signers
//!
//! The orchestration core is written against the `RpcEndpoint` and `Signer`
//! traits; the ethers-backed `HttpEndpoint` and `LocalSigner` adapters make
//! the daemon runnable against real networks.

use crate::error::{BroadcastError, BroadcastResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::time::Duration;
use thiserror::Error;

/// Raw provider-level failure; the message text is kept verbatim so it can be
/// classified exactly once upstream.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RpcError {
    pub message: String,
}

impl RpcError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Network-reported fee data, legacy and EIP-1559 fields side by side
#[derive(Debug, Clone, Default)]
pub struct FeeData {
    pub gas_price: Option<U256>,
    pub max_fee_per_gas: Option<U256>,
    pub max_priority_fee_per_gas: Option<U256>,
}

/// One RPC endpoint of one network
#[async_trait]
pub trait RpcEndpoint: Send + Sync {
    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256>;

    async fn transaction_receipt(&self, tx_hash: H256) -> RpcResult<Option<TransactionReceipt>>;

    /// Pending-tagged transaction count (the network's view of the next nonce)
    async fn transaction_count(&self, address: Address) -> RpcResult<u64>;

    async fn fee_data(&self) -> RpcResult<FeeData>;

    async fn block_number(&self) -> RpcResult<u64>;

    async fn balance(&self, address: Address) -> RpcResult<U256>;
}

/// Signing capability, supplied externally per wallet
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_transaction(&self, tx: &TypedTransaction) -> BroadcastResult<Bytes>;
}

/// ethers HTTP JSON-RPC adapter
pub struct HttpEndpoint {
    provider: Provider<Http>,
}

impl HttpEndpoint {
    pub fn new(url: &str) -> BroadcastResult<Self> {
        let provider = Provider::<Http>::try_from(url)
            .map_err(|e| BroadcastError::Config(format!("Invalid RPC url {}: {}", url, e)))?
            .interval(Duration::from_millis(100));
        Ok(Self { provider })
    }
}

fn rpc_err<E: std::fmt::Display>(e: E) -> RpcError {
    RpcError::new(e.to_string())
}

#[async_trait]
impl RpcEndpoint for HttpEndpoint {
    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(rpc_err)?;
        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, tx_hash: H256) -> RpcResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_err)
    }

    async fn transaction_count(&self, address: Address) -> RpcResult<u64> {
        let count = self
            .provider
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(rpc_err)?;
        Ok(count.as_u64())
    }

    async fn fee_data(&self) -> RpcResult<FeeData> {
        let gas_price = self.provider.get_gas_price().await.map_err(rpc_err)?;

        // Base fee comes from the latest block; priority fee defaults to
        // 2 gwei, refined via fee history on networks that support it.
        let block = self
            .provider
            .get_block(BlockNumber::Latest)
            .await
            .map_err(rpc_err)?;

        let (max_fee, priority_fee) = match block.and_then(|b| b.base_fee_per_gas) {
            Some(base_fee) => {
                let priority = U256::from(2_000_000_000u64);
                // 2x base fee buffers against base-fee growth between blocks
                (Some(base_fee * 2 + priority), Some(priority))
            }
            None => (None, None),
        };

        Ok(FeeData {
            gas_price: Some(gas_price),
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: priority_fee,
        })
    }

    async fn block_number(&self) -> RpcResult<u64> {
        let block = self.provider.get_block_number().await.map_err(rpc_err)?;
        Ok(block.as_u64())
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        self.provider
            .get_balance(address, None)
            .await
            .map_err(rpc_err)
    }
}

/// In-process private-key signer backed by an ethers `LocalWallet`
pub struct LocalSigner {
    wallet: LocalWallet,
}

impl LocalSigner {
    pub fn new(wallet: LocalWallet) -> Self {
        Self { wallet }
    }

    /// Load the signing key from an environment variable
    pub fn from_env(var: &str) -> BroadcastResult<Self> {
        let key = std::env::var(var)
            .map_err(|_| BroadcastError::Signer(format!("{} not set", var)))?;
        let wallet = key
            .parse::<LocalWallet>()
            .map_err(|e| BroadcastError::Signer(format!("Invalid private key: {}", e)))?;
        Ok(Self { wallet })
    }
}

#[async_trait]
impl TxSigner for LocalSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> BroadcastResult<Bytes> {
        let chain_id = tx
            .chain_id()
            .map(|c| c.as_u64())
            .unwrap_or_else(|| self.wallet.chain_id());
        let wallet = self.wallet.clone().with_chain_id(chain_id);

        let signature = wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| BroadcastError::Signer(e.to_string()))?;

        Ok(tx.rlp_signed(&signature))
    }
}
