//! Per-account transaction tracker
//!
//! A `Wallet` owns one key, one nonce counter and the set of transactions
//! it has in flight. Every nonce allocation and pending-set mutation happens
//! under the wallet's lock; gas estimation happens outside it.

use super::gas::{self, GasPolicy};
use super::nonce::{NonceLedger, TrackedTransaction};
use crate::chain::{BlockSnapshot, ChainPort};
use crate::error::{FanError, FanResult};

use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TxHash, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// One account and its in-flight transactions
pub struct Wallet {
    /// Display name used in logs
    name: String,
    /// Signing key, bound to the chain ID
    signer: LocalWallet,
    /// Node interface
    chain: Arc<dyn ChainPort>,
    /// Gas policy governing resends
    policy: GasPolicy,
    /// Nonce counter and pending set
    ledger: Mutex<NonceLedger>,
    /// How often `wait_for_confirmation` checks the pending set
    poll_interval: Duration,
}

impl Wallet {
    /// Create a wallet, starting from the account's pending nonce on chain
    pub async fn new(
        name: impl Into<String>,
        signer: LocalWallet,
        chain: Arc<dyn ChainPort>,
        policy: GasPolicy,
    ) -> FanResult<Self> {
        let signer = signer.with_chain_id(chain.chain_id());
        let first_nonce = chain.pending_nonce_at(signer.address()).await?;
        let name = name.into();

        debug!(
            "Wallet {} ({:?}) starts at nonce {} with policy {}",
            name,
            signer.address(),
            first_nonce,
            policy.name
        );

        Ok(Self {
            name,
            signer,
            chain,
            policy,
            ledger: Mutex::new(NonceLedger::new(first_nonce)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Create a wallet with a freshly generated key
    pub async fn random(
        name: impl Into<String>,
        chain: Arc<dyn ChainPort>,
        policy: GasPolicy,
    ) -> FanResult<Self> {
        let signer = LocalWallet::new(&mut rand::thread_rng());
        Self::new(name, signer, chain, policy).await
    }

    /// Override the confirmation poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn policy(&self) -> &GasPolicy {
        &self.policy
    }

    /// Sign and broadcast a transfer of `value` wei to `to`
    ///
    /// The nonce is consumed once allocated. If the broadcast fails the
    /// pending entry is dropped and the nonce is left as a gap.
    pub async fn submit(&self, to: Address, value: U256) -> FanResult<TxHash> {
        let base_fee = self.current_base_fee().await?;
        let tip_cap = self.chain.suggest_tip_cap().await?;
        let fee_cap = gas::fee_cap(base_fee, tip_cap);

        let request = Eip1559TransactionRequest::new()
            .from(self.address())
            .to(to)
            .value(value)
            .max_priority_fee_per_gas(tip_cap)
            .max_fee_per_gas(fee_cap)
            .chain_id(self.chain.chain_id());

        // Estimation failures must not burn a nonce
        let gas_limit = self
            .chain
            .estimate_gas(&TypedTransaction::Eip1559(request.clone()))
            .await?;

        let nonce = self.ledger.lock().await.allocate();
        let typed = TypedTransaction::Eip1559(request.nonce(nonce).gas(gas_limit));
        let (raw, hash) = self.sign(&typed).await?;

        self.ledger.lock().await.track(TrackedTransaction {
            hash,
            nonce,
            to,
            value,
            gas_limit,
            fee_cap,
            tip_cap,
            submitted_at: Instant::now(),
            attempt: 1,
        });

        if let Err(e) = self.chain.send_raw_transaction(raw).await {
            self.ledger.lock().await.forget(nonce, hash);
            let error = match e {
                FanError::Rpc(message) => FanError::Submission { nonce, message },
                other => other,
            };
            crate::metrics::record_tx_failed(&error);
            debug!("{}: broadcast of nonce {} failed: {}", self.name, nonce, error);
            return Err(error);
        }

        crate::metrics::record_tx_submitted(self.policy.name);
        debug!(
            "{}: submitted {:?} nonce {} tip {} fee cap {}",
            self.name, hash, nonce, tip_cap, fee_cap
        );

        Ok(hash)
    }

    /// Reconcile pending transactions against `block`
    ///
    /// Transactions included in the block are dropped. Transactions older
    /// than the resend timeout are replaced at the same nonce with bumped
    /// fees. Returns how many remain pending. The whole pass runs under the
    /// wallet lock.
    pub async fn reconcile(&self, block: &BlockSnapshot) -> usize {
        let mut ledger = self.ledger.lock().await;
        ledger.set_base_fee(block.base_fee);

        let confirmed = ledger.confirm_included(block);
        if !confirmed.is_empty() {
            crate::metrics::record_tx_confirmed(self.policy.name, confirmed.len());
            for tx in &confirmed {
                debug!(
                    "{}: {:?} (nonce {}) confirmed in block {}",
                    self.name, tx.hash, tx.nonce, block.number
                );
            }
        }

        let now = Instant::now();
        for stale in ledger.expired(now, self.policy.resend_timeout) {
            match self.resend(&stale, block.base_fee, now).await {
                Ok(replacement) => {
                    crate::metrics::record_tx_replaced(self.policy.name);
                    debug!(
                        "{}: replaced {:?} with {:?} at nonce {} (attempt {}, tip {} -> {})",
                        self.name,
                        stale.hash,
                        replacement.hash,
                        stale.nonce,
                        replacement.attempt,
                        stale.tip_cap,
                        replacement.tip_cap
                    );
                    ledger.track(replacement);
                }
                Err(FanError::NonceTooLow(_)) => {
                    // Mined in a block this wallet never saw
                    debug!(
                        "{}: nonce {} already used on chain, treating as confirmed",
                        self.name, stale.nonce
                    );
                    ledger.confirm(stale.nonce);
                    crate::metrics::record_tx_confirmed(self.policy.name, 1);
                }
                Err(e) => {
                    crate::metrics::record_tx_failed(&e);
                    warn!(
                        "{}: resend of nonce {} failed, keeping {:?}: {}",
                        self.name, stale.nonce, stale.hash, e
                    );
                }
            }
        }

        ledger.pending_count()
    }

    /// Replace `stale` at the same nonce with bumped fees
    async fn resend(
        &self,
        stale: &TrackedTransaction,
        base_fee: U256,
        now: Instant,
    ) -> FanResult<TrackedTransaction> {
        let (tip_cap, fee_cap) = gas::replacement_fees(
            base_fee,
            stale.tip_cap,
            stale.fee_cap,
            self.policy.fee_multiplier,
        );

        let typed = TypedTransaction::Eip1559(
            Eip1559TransactionRequest::new()
                .from(self.address())
                .to(stale.to)
                .value(stale.value)
                .nonce(stale.nonce)
                .gas(stale.gas_limit)
                .max_priority_fee_per_gas(tip_cap)
                .max_fee_per_gas(fee_cap)
                .chain_id(self.chain.chain_id()),
        );

        let (raw, hash) = self.sign(&typed).await?;
        self.chain.send_raw_transaction(raw).await?;

        Ok(TrackedTransaction {
            hash,
            tip_cap,
            fee_cap,
            submitted_at: now,
            attempt: stale.attempt + 1,
            ..stale.clone()
        })
    }

    /// Wait until `tx_hash`, or whatever replaced it, is seen in a block
    ///
    /// Polls without holding the lock between checks. The transaction stays
    /// tracked when the timeout elapses.
    pub async fn wait_for_confirmation(&self, tx_hash: TxHash, timeout: Duration) -> FanResult<()> {
        let nonce = {
            let ledger = self.ledger.lock().await;
            match ledger.find(&tx_hash) {
                Some(tx) => tx.nonce,
                None if ledger.confirmed_nonce(&tx_hash).is_some() => return Ok(()),
                None => return Err(FanError::TransactionNotTracked { tx_hash }),
            }
        };

        let deadline = Instant::now() + timeout;
        loop {
            if !self.ledger.lock().await.is_nonce_pending(nonce) {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(FanError::ConfirmationTimeout { tx_hash, timeout });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Live balance from the node
    pub async fn balance(&self) -> FanResult<U256> {
        self.chain.balance_at(self.address()).await
    }

    /// Whether `tx_hash` is the current pending transaction for its nonce
    pub async fn is_pending(&self, tx_hash: TxHash) -> bool {
        self.ledger.lock().await.find(&tx_hash).is_some()
    }

    pub async fn pending_count(&self) -> usize {
        self.ledger.lock().await.pending_count()
    }

    /// Pending transactions ordered by nonce
    pub async fn pending_transactions(&self) -> Vec<TrackedTransaction> {
        self.ledger.lock().await.pending()
    }

    pub async fn next_nonce(&self) -> u64 {
        self.ledger.lock().await.next_nonce()
    }

    /// Base fee of the last reconciled block, or of the latest block on chain
    async fn current_base_fee(&self) -> FanResult<U256> {
        if let Some(base_fee) = self.ledger.lock().await.base_fee() {
            return Ok(base_fee);
        }

        let latest = self
            .chain
            .block_by_number(None)
            .await?
            .ok_or_else(|| FanError::BlockNotFound("latest".to_string()))?;
        info!(
            "{}: no block reconciled yet, using base fee {} from block {}",
            self.name, latest.base_fee, latest.number
        );
        Ok(latest.base_fee)
    }

    async fn sign(&self, tx: &TypedTransaction) -> FanResult<(Bytes, TxHash)> {
        let signature = self
            .signer
            .sign_transaction(tx)
            .await
            .map_err(|e| FanError::Signing(e.to_string()))?;
        Ok((tx.rlp_signed(&signature), tx.hash(&signature)))
    }
}
