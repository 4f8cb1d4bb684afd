//! Chain module - the node interface the simulator consumes
//!
//! This module provides:
//! - The `ChainPort` trait every chain backend implements
//! - Block header and full block snapshots
//! - An ethers-backed provider with HTTP failover and WebSocket heads
//! - The head watcher that resolves blocks and hands them to a sink
//! - A bounded history of observed blocks

pub mod history;
pub mod provider;
pub mod watcher;

pub use history::{BlockHistory, TrackedBlock};
pub use provider::EthChain;
pub use watcher::{BlockSink, ChainWatcher};

use crate::error::FanResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Block, Bytes, TxHash, H256, U256};
use futures::stream::BoxStream;

/// Stream of new chain heads. An `Err` item or the end of the stream means
/// the subscription is gone and must be re-established.
pub type HeaderStream = BoxStream<'static, FanResult<BlockHeader>>;

/// Header data delivered by a head subscription
#[derive(Debug, Clone, PartialEq)]
pub struct BlockHeader {
    pub hash: H256,
    pub number: u64,
    pub base_fee: U256,
    pub gas_used: U256,
    pub gas_limit: U256,
}

impl BlockHeader {
    /// Convert an ethers header. Pending headers without hash or number are rejected.
    pub fn from_ethers<T>(block: &Block<T>) -> Option<Self> {
        Some(Self {
            hash: block.hash?,
            number: block.number?.as_u64(),
            base_fee: block.base_fee_per_gas.unwrap_or_default(),
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
        })
    }
}

/// Full block as seen by accounts: enough to check inclusion and price the next transaction
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSnapshot {
    pub hash: H256,
    pub number: u64,
    pub base_fee: U256,
    pub gas_used: U256,
    pub gas_limit: U256,
    pub transactions: Vec<TxHash>,
}

impl BlockSnapshot {
    /// Convert an ethers block carrying transaction hashes
    pub fn from_ethers(block: &Block<TxHash>) -> Option<Self> {
        let header = BlockHeader::from_ethers(block)?;
        Some(Self {
            hash: header.hash,
            number: header.number,
            base_fee: header.base_fee,
            gas_used: header.gas_used,
            gas_limit: header.gas_limit,
            transactions: block.transactions.clone(),
        })
    }

    /// Whether the block includes `tx_hash`
    pub fn contains(&self, tx_hash: &TxHash) -> bool {
        self.transactions.contains(tx_hash)
    }

    /// Share of the gas limit used, in percent
    pub fn percent_filled(&self) -> f64 {
        if self.gas_limit.is_zero() {
            return 0.0;
        }
        self.gas_used.low_u128() as f64 / self.gas_limit.low_u128() as f64 * 100.0
    }
}

/// Everything the simulator needs from a node
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainPort: Send + Sync {
    /// Chain ID used for signing
    fn chain_id(&self) -> u64;

    /// Broadcast a signed, encoded transaction
    async fn send_raw_transaction(&self, signed: Bytes) -> FanResult<TxHash>;

    /// Nonce including transactions still in the node's pool
    async fn pending_nonce_at(&self, address: Address) -> FanResult<u64>;

    /// Current balance in wei
    async fn balance_at(&self, address: Address) -> FanResult<U256>;

    /// Priority fee the node suggests
    async fn suggest_tip_cap(&self) -> FanResult<U256>;

    /// Gas units needed for `tx`
    async fn estimate_gas(&self, tx: &TypedTransaction) -> FanResult<U256>;

    /// Full block by hash
    async fn block_by_hash(&self, hash: H256) -> FanResult<Option<BlockSnapshot>>;

    /// Full block by number, `None` for the latest block
    async fn block_by_number(&self, number: Option<u64>) -> FanResult<Option<BlockSnapshot>>;

    /// Subscribe to new chain heads
    async fn subscribe_new_heads(&self) -> FanResult<HeaderStream>;
}
