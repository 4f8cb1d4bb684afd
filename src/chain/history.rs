//! Bounded record of blocks the watcher has delivered

use super::BlockSnapshot;

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Summary of an observed block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedBlock {
    pub hash: H256,
    pub number: u64,
    pub base_fee: U256,
    pub gas_used: U256,
    pub gas_limit: U256,
    pub transaction_count: usize,
    pub percent_filled: f64,
    pub received_at: DateTime<Utc>,
}

impl From<&BlockSnapshot> for TrackedBlock {
    fn from(block: &BlockSnapshot) -> Self {
        Self {
            hash: block.hash,
            number: block.number,
            base_fee: block.base_fee,
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
            transaction_count: block.transactions.len(),
            percent_filled: block.percent_filled(),
            received_at: Utc::now(),
        }
    }
}

/// Most recent blocks keyed by number; the oldest are evicted past `capacity`
pub struct BlockHistory {
    blocks: RwLock<BTreeMap<u64, TrackedBlock>>,
    capacity: usize,
}

impl BlockHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Record a block, replacing any earlier block at the same height
    pub async fn record(&self, block: &BlockSnapshot) {
        let mut blocks = self.blocks.write().await;
        blocks.insert(block.number, TrackedBlock::from(block));
        while blocks.len() > self.capacity {
            blocks.pop_first();
        }
    }

    /// All recorded blocks in ascending order
    pub async fn all(&self) -> Vec<TrackedBlock> {
        self.blocks.read().await.values().cloned().collect()
    }

    /// Blocks strictly after `number`
    pub async fn since(&self, number: u64) -> Vec<TrackedBlock> {
        self.blocks
            .read()
            .await
            .range(number.saturating_add(1)..)
            .map(|(_, block)| block.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64) -> BlockSnapshot {
        BlockSnapshot {
            hash: H256::from_low_u64_be(number),
            number,
            base_fee: U256::from(number * 10),
            gas_used: U256::zero(),
            gas_limit: U256::from(30_000_000),
            transactions: vec![H256::from_low_u64_be(1000 + number)],
        }
    }

    #[tokio::test]
    async fn test_since_returns_later_blocks() {
        let history = BlockHistory::new(16);
        for n in 1..=5 {
            history.record(&block(n)).await;
        }

        let later: Vec<u64> = history.since(3).await.iter().map(|b| b.number).collect();
        assert_eq!(later, vec![4, 5]);
        assert!(history.since(5).await.is_empty());
        assert_eq!(history.all().await.len(), 5);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let history = BlockHistory::new(3);
        for n in 10..15 {
            history.record(&block(n)).await;
        }

        let numbers: Vec<u64> = history.all().await.iter().map(|b| b.number).collect();
        assert_eq!(numbers, vec![12, 13, 14]);
        assert_eq!(history.all().await.len(), 3);
    }
}
