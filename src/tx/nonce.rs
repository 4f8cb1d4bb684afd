//! Nonce ledger for a single account
//!
//! Handles:
//! - Local nonce allocation (never reused, even after a failed send)
//! - One pending transaction per nonce, replaced in place on resend
//! - Removal of transactions observed in a block

use crate::chain::BlockSnapshot;

use ethers::types::{Address, TxHash, U256};
use std::collections::{BTreeMap, VecDeque};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// How many confirmed hashes are remembered for late confirmation waiters
const CONFIRMED_HISTORY: usize = 1024;

/// A submitted transaction that has not been seen in a block yet
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedTransaction {
    pub hash: TxHash,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub gas_limit: U256,
    pub fee_cap: U256,
    pub tip_cap: U256,
    pub submitted_at: Instant,
    /// 1 for the first send, incremented on every replacement
    pub attempt: u32,
}

impl TrackedTransaction {
    /// Whether this transaction has waited longer than `timeout`
    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.submitted_at) > timeout
    }
}

/// Nonce counter and pending set, guarded by the owning wallet's lock
#[derive(Debug)]
pub struct NonceLedger {
    /// Next nonce to hand out
    next: u64,
    /// Pending transactions: nonce -> transaction
    pending: BTreeMap<u64, TrackedTransaction>,
    /// Recently confirmed (nonce, hash) pairs, oldest first
    confirmed: VecDeque<(u64, TxHash)>,
    /// Base fee of the most recently reconciled block
    last_base_fee: Option<U256>,
}

impl NonceLedger {
    /// Create a ledger starting at the account's pending nonce on chain
    pub fn new(first_nonce: u64) -> Self {
        Self {
            next: first_nonce,
            pending: BTreeMap::new(),
            confirmed: VecDeque::new(),
            last_base_fee: None,
        }
    }

    /// Hand out the next nonce
    pub fn allocate(&mut self) -> u64 {
        let nonce = self.next;
        self.next += 1;
        nonce
    }

    /// Next nonce that would be allocated
    pub fn next_nonce(&self) -> u64 {
        self.next
    }

    /// Track a transaction, replacing any previous entry with the same nonce
    pub fn track(&mut self, tx: TrackedTransaction) -> Option<TrackedTransaction> {
        debug_assert!(tx.nonce < self.next, "tracked nonce was never allocated");
        self.pending.insert(tx.nonce, tx)
    }

    /// Drop the entry for `nonce` if it still refers to `hash`
    pub fn forget(&mut self, nonce: u64, hash: TxHash) -> Option<TrackedTransaction> {
        match self.pending.get(&nonce) {
            Some(tx) if tx.hash == hash => self.pending.remove(&nonce),
            _ => None,
        }
    }

    /// Mark the entry for `nonce` as mined
    pub fn confirm(&mut self, nonce: u64) -> Option<TrackedTransaction> {
        let tx = self.pending.remove(&nonce)?;
        self.confirmed.push_back((tx.nonce, tx.hash));
        if self.confirmed.len() > CONFIRMED_HISTORY {
            self.confirmed.pop_front();
        }
        Some(tx)
    }

    /// Remove every pending transaction contained in `block`
    pub fn confirm_included(&mut self, block: &BlockSnapshot) -> Vec<TrackedTransaction> {
        let mined: Vec<u64> = self
            .pending
            .values()
            .filter(|tx| block.contains(&tx.hash))
            .map(|tx| tx.nonce)
            .collect();

        let confirmed: Vec<_> = mined.into_iter().filter_map(|n| self.confirm(n)).collect();
        if !confirmed.is_empty() {
            debug!(
                "Block {} confirmed {} tracked transactions",
                block.number,
                confirmed.len()
            );
        }
        confirmed
    }

    /// Pending transactions older than `timeout`
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<TrackedTransaction> {
        self.pending
            .values()
            .filter(|tx| tx.is_expired(now, timeout))
            .cloned()
            .collect()
    }

    /// Pending entry holding `hash`
    pub fn find(&self, hash: &TxHash) -> Option<&TrackedTransaction> {
        self.pending.values().find(|tx| tx.hash == *hash)
    }

    /// Whether `nonce` has a pending entry
    pub fn is_nonce_pending(&self, nonce: u64) -> bool {
        self.pending.contains_key(&nonce)
    }

    /// Nonce of a recently confirmed hash
    pub fn confirmed_nonce(&self, hash: &TxHash) -> Option<u64> {
        self.confirmed
            .iter()
            .rev()
            .find(|(_, h)| h == hash)
            .map(|(n, _)| *n)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of the pending set ordered by nonce
    pub fn pending(&self) -> Vec<TrackedTransaction> {
        self.pending.values().cloned().collect()
    }

    pub fn set_base_fee(&mut self, base_fee: U256) {
        self.last_base_fee = Some(base_fee);
    }

    pub fn base_fee(&self) -> Option<U256> {
        self.last_base_fee
    }
}
