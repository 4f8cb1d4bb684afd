//! In-memory chain used by unit tests
//!
//! `MockChain` decodes the signed transactions it receives, keeps a mempool
//! keyed by sender and nonce, mines blocks on demand and pushes headers to
//! every live subscriber. Like a real node it never mines a transaction
//! sitting behind a nonce gap.

use crate::chain::{BlockHeader, BlockSnapshot, ChainPort, HeaderStream};
use crate::error::{FanError, FanResult};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, TxHash, H256, U256};
use ethers::utils::{keccak256, rlp::Rlp};
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const GWEI: u64 = 1_000_000_000;

const TRANSFER_GAS: u64 = 21_000;
const BLOCK_GAS_LIMIT: u64 = 30_000_000;

pub fn random_address() -> Address {
    Address::from(rand::random::<[u8; 20]>())
}

pub fn random_hash() -> TxHash {
    H256::from(rand::random::<[u8; 32]>())
}

/// A transaction accepted into the mock mempool
#[derive(Debug, Clone, PartialEq)]
pub struct SentTransaction {
    pub hash: TxHash,
    pub from: Address,
    pub to: Address,
    pub nonce: u64,
    pub value: U256,
    pub gas: U256,
    pub tip_cap: U256,
    pub fee_cap: U256,
}

struct State {
    /// Next nonce the chain expects per account
    nonces: HashMap<Address, u64>,
    balances: HashMap<Address, U256>,
    mempool: BTreeMap<(Address, u64), SentTransaction>,
    sent: Vec<SentTransaction>,
    blocks: HashMap<H256, BlockSnapshot>,
    /// Block hashes by number
    canonical: Vec<H256>,
    base_fee: U256,
    tip: U256,
    send_failures: VecDeque<FanError>,
    /// Recipients whose transfers are rejected
    rejected_recipients: HashMap<Address, String>,
    send_delay: Duration,
    subscribers: Vec<mpsc::UnboundedSender<FanResult<BlockHeader>>>,
    subscribe_failures: usize,
    subscribe_calls: usize,
}

pub struct MockChain {
    chain_id: u64,
    state: Mutex<State>,
}

impl MockChain {
    /// A chain holding only a genesis block
    pub fn new(chain_id: u64) -> Self {
        let genesis = BlockSnapshot {
            hash: block_hash(0),
            number: 0,
            base_fee: U256::from(GWEI),
            gas_used: U256::zero(),
            gas_limit: U256::from(BLOCK_GAS_LIMIT),
            transactions: vec![],
        };

        Self {
            chain_id,
            state: Mutex::new(State {
                nonces: HashMap::new(),
                balances: HashMap::new(),
                mempool: BTreeMap::new(),
                sent: Vec::new(),
                canonical: vec![genesis.hash],
                blocks: HashMap::from([(genesis.hash, genesis)]),
                base_fee: U256::from(GWEI),
                tip: U256::from(GWEI),
                send_failures: VecDeque::new(),
                rejected_recipients: HashMap::new(),
                send_delay: Duration::ZERO,
                subscribers: Vec::new(),
                subscribe_failures: 0,
                subscribe_calls: 0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("mock chain state poisoned")
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn balance(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state().nonces.insert(address, nonce);
    }

    /// Reject the next broadcast with `error`
    pub fn fail_next_send(&self, error: FanError) {
        self.state().send_failures.push_back(error);
    }

    /// Reject every transfer to `recipient` with an RPC error
    pub fn reject_sends_to(&self, recipient: Address, message: &str) {
        self.state()
            .rejected_recipients
            .insert(recipient, message.to_string());
    }

    /// Make every broadcast take `delay` before the node answers
    pub fn set_send_delay(&self, delay: Duration) {
        self.state().send_delay = delay;
    }

    /// Refuse the next `count` subscription attempts
    pub fn fail_subscriptions(&self, count: usize) {
        self.state().subscribe_failures = count;
    }

    /// Error out every open head stream
    pub fn break_subscriptions(&self) {
        for subscriber in self.state().subscribers.drain(..) {
            let _ = subscriber.unbounded_send(Err(FanError::Subscription(
                "connection reset".to_string(),
            )));
        }
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    /// Every transaction accepted so far, in arrival order
    pub fn sent(&self) -> Vec<SentTransaction> {
        self.state().sent.clone()
    }

    /// Wait until at least `count` head streams are open
    pub async fn wait_for_subscribers(&self, count: usize) {
        loop {
            {
                let mut state = self.state();
                state.subscribers.retain(|s| !s.is_closed());
                if state.subscribers.len() >= count {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Mine every mempool transaction into a new block
    pub fn mine(&self) -> BlockSnapshot {
        self.mine_where(|_| true)
    }

    /// Mine the mempool transactions matching `include` into a new block
    pub fn mine_where(&self, include: impl Fn(&SentTransaction) -> bool) -> BlockSnapshot {
        let mut state = self.state();

        // Per sender, only a contiguous run from the account nonce is minable
        let senders: BTreeSet<Address> = state.mempool.keys().map(|(from, _)| *from).collect();
        let mut selected: Vec<(Address, u64)> = Vec::new();
        for from in senders {
            let mut nonce = state.nonces.get(&from).copied().unwrap_or_default();
            while let Some(tx) = state.mempool.get(&(from, nonce)) {
                if !include(tx) {
                    break;
                }
                selected.push((from, nonce));
                nonce += 1;
            }
        }

        let base_fee = state.base_fee;
        let mut transactions = Vec::with_capacity(selected.len());
        for key in selected {
            let Some(tx) = state.mempool.remove(&key) else {
                continue;
            };

            let price = std::cmp::min(tx.fee_cap, base_fee + tx.tip_cap);
            let cost = tx.value + tx.gas * price;
            let sender = state.balances.entry(tx.from).or_default();
            *sender = sender.saturating_sub(cost);
            *state.balances.entry(tx.to).or_default() += tx.value;

            let next = state.nonces.entry(tx.from).or_default();
            *next = tx.nonce + 1;
            transactions.push(tx.hash);
        }

        // Drop anything the new nonces invalidated
        let nonces = state.nonces.clone();
        state
            .mempool
            .retain(|(from, nonce), _| *nonce >= nonces.get(from).copied().unwrap_or_default());

        let number = state.canonical.len() as u64;
        let block = BlockSnapshot {
            hash: block_hash(number),
            number,
            base_fee,
            gas_used: U256::from(TRANSFER_GAS * transactions.len() as u64),
            gas_limit: U256::from(BLOCK_GAS_LIMIT),
            transactions,
        };
        state.canonical.push(block.hash);
        state.blocks.insert(block.hash, block.clone());
        block
    }

    /// Push the header of `block` to every open head stream
    pub fn announce(&self, block: &BlockSnapshot) {
        let header = BlockHeader {
            hash: block.hash,
            number: block.number,
            base_fee: block.base_fee,
            gas_used: block.gas_used,
            gas_limit: block.gas_limit,
        };
        self.state()
            .subscribers
            .retain(|s| s.unbounded_send(Ok(header.clone())).is_ok());
    }

    pub fn mine_and_announce(&self) -> BlockSnapshot {
        let block = self.mine();
        self.announce(&block);
        block
    }

    /// Mine and announce a block every `interval` until the handle is aborted
    pub fn auto_mine(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                chain.mine_and_announce();
            }
        })
    }
}

fn block_hash(number: u64) -> H256 {
    H256::from(keccak256(number.to_be_bytes()))
}

fn decode(raw: &Bytes) -> FanResult<SentTransaction> {
    let (tx, signature) = TypedTransaction::decode_signed(&Rlp::new(raw.as_ref()))
        .map_err(|e| FanError::Rpc(format!("rlp: {}", e)))?;
    let from = signature
        .recover(tx.sighash())
        .map_err(|e| FanError::Rpc(format!("invalid signature: {}", e)))?;

    let TypedTransaction::Eip1559(request) = &tx else {
        return Err(FanError::Rpc("only dynamic fee transactions are accepted".to_string()));
    };

    Ok(SentTransaction {
        hash: H256::from(keccak256(raw.as_ref())),
        from,
        to: tx.to_addr().copied().unwrap_or_default(),
        nonce: tx.nonce().copied().unwrap_or_default().as_u64(),
        value: tx.value().copied().unwrap_or_default(),
        gas: tx.gas().copied().unwrap_or_default(),
        tip_cap: request.max_priority_fee_per_gas.unwrap_or_default(),
        fee_cap: request.max_fee_per_gas.unwrap_or_default(),
    })
}

#[async_trait]
impl ChainPort for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn send_raw_transaction(&self, signed: Bytes) -> FanResult<TxHash> {
        let tx = decode(&signed)?;
        let delay = self.state().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();

        if let Some(error) = state.send_failures.pop_front() {
            return Err(error);
        }
        if let Some(message) = state.rejected_recipients.get(&tx.to) {
            return Err(FanError::Rpc(message.clone()));
        }

        let expected = state.nonces.get(&tx.from).copied().unwrap_or_default();
        if tx.nonce < expected {
            return Err(FanError::NonceTooLow(format!(
                "nonce too low: next nonce {}, tx nonce {}",
                expected, tx.nonce
            )));
        }

        let balance = state.balances.get(&tx.from).copied().unwrap_or_default();
        let cost = tx.value + tx.gas * tx.fee_cap;
        if balance < cost {
            return Err(FanError::InsufficientFunds(format!(
                "insufficient funds for gas * price + value: have {} want {}",
                balance, cost
            )));
        }

        let hash = tx.hash;
        state.mempool.insert((tx.from, tx.nonce), tx.clone());
        state.sent.push(tx);
        Ok(hash)
    }

    async fn pending_nonce_at(&self, address: Address) -> FanResult<u64> {
        let state = self.state();
        let mined = state.nonces.get(&address).copied().unwrap_or_default();
        let pooled = state
            .mempool
            .keys()
            .filter(|(from, _)| *from == address)
            .map(|(_, nonce)| nonce + 1)
            .max()
            .unwrap_or_default();
        Ok(mined.max(pooled))
    }

    async fn balance_at(&self, address: Address) -> FanResult<U256> {
        Ok(self.balance(address))
    }

    async fn suggest_tip_cap(&self) -> FanResult<U256> {
        Ok(self.state().tip)
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> FanResult<U256> {
        Ok(U256::from(TRANSFER_GAS))
    }

    async fn block_by_hash(&self, hash: H256) -> FanResult<Option<BlockSnapshot>> {
        Ok(self.state().blocks.get(&hash).cloned())
    }

    async fn block_by_number(&self, number: Option<u64>) -> FanResult<Option<BlockSnapshot>> {
        let state = self.state();
        let hash = match number {
            Some(n) => state.canonical.get(n as usize).copied(),
            None => state.canonical.last().copied(),
        };
        Ok(hash.and_then(|h| state.blocks.get(&h).cloned()))
    }

    async fn subscribe_new_heads(&self) -> FanResult<HeaderStream> {
        let mut state = self.state();
        state.subscribe_calls += 1;
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(FanError::Subscription("connection refused".to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push(tx);
        Ok(rx.boxed())
    }
}
