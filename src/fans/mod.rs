//! Fans - accounts that generate load on every new block
//!
//! This module provides:
//! - The `Agent` trait the orchestrator drives
//! - `Fan`, the canonical agent backed by a `Wallet`
//! - Reports agents raise to the orchestrator

mod fan;

pub use fan::Fan;

use crate::chain::BlockSnapshot;
use crate::tx::{CrazedLevel, Wallet};

use async_trait::async_trait;
use ethers::types::Address;
use std::sync::Arc;
use uuid::Uuid;

/// Conditions an agent cannot resolve on its own
#[derive(Debug, Clone, PartialEq)]
pub enum FanReport {
    /// A submission was rejected for lack of balance
    OutOfFunds {
        fan_id: Uuid,
        name: String,
        address: Address,
    },
}

/// An account that reacts to new blocks
///
/// Agents move between Idle and Searching. While searching, every delivered
/// block is reconciled against the agent's wallet and may trigger a new
/// submission.
#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> Uuid;

    fn name(&self) -> &str;

    fn address(&self) -> Address;

    fn level(&self) -> CrazedLevel;

    fn wallet(&self) -> &Arc<Wallet>;

    /// Idle -> Searching. No-op while already searching.
    async fn start(&self);

    /// Searching -> Idle. Returns once the block loop has exited. No-op while idle.
    async fn stop(&self);

    fn is_searching(&self) -> bool;

    /// Queue a block for the block loop without waiting for it to be processed
    async fn deliver(&self, block: Arc<BlockSnapshot>);

    async fn pending_count(&self) -> usize {
        self.wallet().pending_count().await
    }
}
