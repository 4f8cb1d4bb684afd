//! The President - orchestrates the fan pool against a single chain watcher
//!
//! Owns the funding wallet, the roster of fans and the stop conditions.
//! Every block resolved by the `ChainWatcher` is recorded and queued for
//! every fan and for the funding wallet's own reconcile loop without
//! waiting for any of them to process it.

use crate::chain::{BlockHistory, BlockSink, BlockSnapshot, ChainPort, ChainWatcher};
use crate::config::Settings;
use crate::error::{FanError, FanResult};
use crate::fans::{Agent, Fan, FanReport};
use crate::tx::{CrazedLevel, GasPolicy, Wallet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use ethers::signers::LocalWallet;
use ethers::types::{Address, TxHash, U256};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Orchestrator tuning
#[derive(Debug, Clone)]
pub struct PresidentConfig {
    /// Level given to recruited fans
    pub crazed_level: CrazedLevel,
    /// Refund sent to fans that run dry; refunds are off when `None`
    pub top_up_amount: Option<U256>,
    /// How long a funding transfer may take to land
    pub funding_timeout: Duration,
    pub resubscribe_delay: Duration,
    pub confirmation_poll: Duration,
    pub history_capacity: usize,
}

impl Default for PresidentConfig {
    fn default() -> Self {
        Self {
            crazed_level: CrazedLevel::Mixed,
            top_up_amount: None,
            funding_timeout: Duration::from_secs(120),
            resubscribe_delay: Duration::from_secs(1),
            confirmation_poll: Duration::from_millis(250),
            history_capacity: 1024,
        }
    }
}

impl PresidentConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            crazed_level: settings.crazed_level(),
            top_up_amount: settings.top_up_amount()?,
            funding_timeout: Duration::from_secs(settings.funding.confirmation_timeout_secs),
            resubscribe_delay: Duration::from_millis(settings.simulation.resubscribe_delay_ms),
            confirmation_poll: Duration::from_millis(settings.simulation.confirmation_poll_ms),
            history_capacity: settings.simulation.history_capacity,
        })
    }
}

/// Armed stop condition, checked after every dispatched block
#[derive(Debug, Default)]
struct StopCondition {
    at_block: Option<u64>,
    at_time: Option<Instant>,
}

impl StopCondition {
    fn is_met(&self, block_number: u64, now: Instant) -> bool {
        self.at_block.is_some_and(|target| block_number >= target)
            || self.at_time.is_some_and(|deadline| now >= deadline)
    }
}

/// Snapshot of the simulation for the status API
#[derive(Debug, Clone, Serialize)]
pub struct PresidentStatus {
    pub chain_id: u64,
    pub funder: Address,
    pub fans: usize,
    pub searching: usize,
    pub latest_block: Option<u64>,
    pub pending_transactions: usize,
    pub refunds_in_flight: usize,
    pub started_at: DateTime<Utc>,
}

pub struct President {
    chain: Arc<dyn ChainPort>,
    funder: Arc<Wallet>,
    /// Feeds the funding wallet's reconcile loop
    funder_blocks: mpsc::UnboundedSender<Arc<BlockSnapshot>>,
    config: PresidentConfig,
    fans: RwLock<Vec<Arc<dyn Agent>>>,
    /// Fans recruited so far, used for naming
    recruited: AtomicUsize,
    latest: RwLock<Option<Arc<BlockSnapshot>>>,
    history: BlockHistory,
    stop_condition: Mutex<StopCondition>,
    reports: mpsc::UnboundedSender<FanReport>,
    report_rx: Mutex<Option<mpsc::UnboundedReceiver<FanReport>>>,
    /// Fans with a refund in flight
    refunding: DashSet<Address>,
    watching: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl President {
    /// Create the orchestrator around the funding account `funding_key`
    pub async fn new(
        chain: Arc<dyn ChainPort>,
        funding_key: LocalWallet,
        config: PresidentConfig,
    ) -> FanResult<Arc<Self>> {
        let funder = Wallet::new("President", funding_key, chain.clone(), GasPolicy::president())
            .await?
            .with_poll_interval(config.confirmation_poll);
        info!(
            "President {:?} ready on chain {} (fans: {})",
            funder.address(),
            chain.chain_id(),
            config.crazed_level
        );

        let (reports, report_rx) = mpsc::unbounded_channel();
        let (funder_blocks, funder_rx) = mpsc::unbounded_channel();
        let funder = Arc::new(funder);
        let cancel = CancellationToken::new();
        let funder_task = tokio::spawn(reconcile_funder(
            funder.clone(),
            funder_rx,
            cancel.child_token(),
        ));

        Ok(Arc::new(Self {
            chain,
            funder,
            funder_blocks,
            history: BlockHistory::new(config.history_capacity),
            config,
            fans: RwLock::new(Vec::new()),
            recruited: AtomicUsize::new(0),
            latest: RwLock::new(None),
            stop_condition: Mutex::new(StopCondition::default()),
            reports,
            report_rx: Mutex::new(Some(report_rx)),
            refunding: DashSet::new(),
            watching: AtomicBool::new(false),
            cancel,
            tasks: Mutex::new(vec![funder_task]),
            started_at: Utc::now(),
        }))
    }

    /// Start the chain watcher and the refund loop. Calling it again is a no-op.
    pub async fn watch(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let sink: Arc<dyn BlockSink> = self.clone();
        let watcher = ChainWatcher::new(self.chain.clone(), sink, self.config.resubscribe_delay);
        let mut tasks = self.tasks.lock().await;
        tasks.push(watcher.spawn(self.cancel.child_token()));

        if let Some(report_rx) = self.report_rx.lock().await.take() {
            let president = self.clone();
            let cancel = self.cancel.child_token();
            tasks.push(tokio::spawn(async move {
                president.refund_loop(report_rx, cancel).await
            }));
        }
    }

    /// Create `count` new fans with fresh keys
    pub async fn recruit(&self, count: usize) -> FanResult<Vec<Arc<dyn Agent>>> {
        let offset = self.recruited.fetch_add(count, Ordering::SeqCst);
        let recruits = (1..=count).map(|n| {
            Fan::recruit(
                format!("fan-{}", offset + n),
                self.config.crazed_level,
                self.chain.clone(),
                Some(self.reports.clone()),
            )
        });

        let mut recruited: Vec<Arc<dyn Agent>> = Vec::with_capacity(count);
        for fan in join_all(recruits).await {
            let fan = fan?;
            debug!("Recruited {} ({}) at {:?}", fan.name(), fan.level(), fan.address());
            recruited.push(Arc::new(fan));
        }

        self.fans.write().await.extend(recruited.iter().cloned());
        info!("Recruited {} fans", recruited.len());
        Ok(recruited)
    }

    pub async fn fans(&self) -> Vec<Arc<dyn Agent>> {
        self.fans.read().await.clone()
    }

    pub fn funder(&self) -> &Arc<Wallet> {
        &self.funder
    }

    pub fn history(&self) -> &BlockHistory {
        &self.history
    }

    pub async fn latest_block(&self) -> Option<Arc<BlockSnapshot>> {
        self.latest.read().await.clone()
    }

    /// Start every fan with no stop condition
    pub async fn activate(&self) {
        *self.stop_condition.lock().await = StopCondition::default();
        self.start_all().await;
    }

    /// Start every fan and stop them at the first block after `duration`
    pub async fn activate_for_duration(&self, duration: Duration) {
        *self.stop_condition.lock().await = StopCondition {
            at_block: None,
            at_time: Some(Instant::now() + duration),
        };
        info!("Fans will stop after {:?}", duration);
        self.start_all().await;
    }

    /// Start every fan and stop them once `blocks` more blocks have arrived
    pub async fn activate_for_blocks(&self, blocks: u64) -> FanResult<()> {
        let current = match self.latest_block().await {
            Some(block) => block.number,
            None => {
                self.chain
                    .block_by_number(None)
                    .await?
                    .ok_or_else(|| FanError::BlockNotFound("latest".to_string()))?
                    .number
            }
        };

        let target = current + blocks;
        *self.stop_condition.lock().await = StopCondition {
            at_block: Some(target),
            at_time: None,
        };
        info!("Fans will stop at block {}", target);
        self.start_all().await;
        Ok(())
    }

    async fn start_all(&self) {
        let fans = self.fans().await;
        join_all(fans.iter().map(|fan| fan.start())).await;
        info!("{} fans searching", fans.len());
    }

    /// Stop every fan, waiting for their block loops to exit
    pub async fn stop_all(&self) {
        let fans = self.fans().await;
        join_all(fans.iter().map(|fan| fan.stop())).await;
        info!("All fans stopped");
    }

    /// Send `amount` to every fan and wait until all transfers are mined
    ///
    /// Transfers run concurrently. Failures do not cancel the others; the
    /// returned error counts them. Requires `watch` to be running.
    pub async fn fund_all(&self, amount: U256) -> FanResult<Vec<TxHash>> {
        let fans = self.fans().await;
        info!(
            "Funding {} fans with {} ETH each",
            fans.len(),
            ethers::utils::format_ether(amount)
        );

        let results = join_all(fans.iter().map(|fan| self.fund(fan.address(), amount))).await;

        let mut hashes = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (fan, result) in fans.iter().zip(results) {
            match result {
                Ok(hash) => hashes.push(hash),
                Err(e) => {
                    warn!("Funding {} ({:?}) failed: {}", fan.name(), fan.address(), e);
                    failures.push((fan.address(), e.to_string()));
                }
            }
        }

        if !failures.is_empty() {
            return Err(FanError::Funding {
                failed: failures.len(),
                total: fans.len(),
                failures,
            });
        }

        info!("Funded {} fans", hashes.len());
        Ok(hashes)
    }

    /// One funding transfer, confirmed
    async fn fund(&self, to: Address, amount: U256) -> FanResult<TxHash> {
        let result = async {
            let hash = self.funder.submit(to, amount).await?;
            self.funder
                .wait_for_confirmation(hash, self.config.funding_timeout)
                .await?;
            Ok(hash)
        }
        .await;

        crate::metrics::record_funding(result.is_ok());
        result
    }

    async fn refund_loop(
        self: Arc<Self>,
        mut reports: mpsc::UnboundedReceiver<FanReport>,
        cancel: CancellationToken,
    ) {
        let mut refunds = JoinSet::new();

        loop {
            let report = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(_) = refunds.join_next(), if !refunds.is_empty() => continue,
                report = reports.recv() => match report {
                    Some(report) => report,
                    None => break,
                },
            };

            match report {
                FanReport::OutOfFunds {
                    fan_id,
                    name,
                    address,
                } => {
                    debug!("{} ({}) reported out of funds", name, fan_id);
                    self.refund(&mut refunds, name, address);
                }
            }
        }

        // Abort transfers still in flight
        refunds.shutdown().await;
        self.refunding.clear();
        debug!("Refund loop stopped");
    }

    fn refund(self: &Arc<Self>, refunds: &mut JoinSet<()>, name: String, address: Address) {
        let Some(amount) = self.config.top_up_amount else {
            debug!("{} is out of funds and refunds are disabled", name);
            return;
        };
        if !self.refunding.insert(address) {
            return;
        }

        let president = self.clone();
        refunds.spawn(async move {
            match president.fund(address, amount).await {
                Ok(hash) => info!("Refunded {} with {:?}", name, hash),
                Err(e) => error!("Refund for {} failed: {}", name, e),
            }
            president.refunding.remove(&address);
        });
    }

    pub async fn status(&self) -> PresidentStatus {
        let fans = self.fans().await;
        let mut pending_transactions = self.funder.pending_count().await;
        for fan in &fans {
            pending_transactions += fan.pending_count().await;
        }

        PresidentStatus {
            chain_id: self.chain.chain_id(),
            funder: self.funder.address(),
            fans: fans.len(),
            searching: fans.iter().filter(|fan| fan.is_searching()).count(),
            latest_block: self.latest_block().await.map(|block| block.number),
            pending_transactions,
            refunds_in_flight: self.refunding.len(),
            started_at: self.started_at,
        }
    }

    /// Stop every fan, then cancel and join the background tasks
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("President shut down");
    }
}

/// Reconcile the funding wallet against every block, off the dispatch path
async fn reconcile_funder(
    funder: Arc<Wallet>,
    mut blocks: mpsc::UnboundedReceiver<Arc<BlockSnapshot>>,
    cancel: CancellationToken,
) {
    loop {
        let block = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };

        let pending = funder.reconcile(&block).await;
        debug!(
            "Block {} ({:.1}% full, base fee {}), {} funding transfers pending",
            block.number,
            block.percent_filled(),
            block.base_fee,
            pending
        );
    }
    debug!("Funding reconcile loop stopped");
}

#[async_trait]
impl BlockSink for President {
    async fn on_block(&self, block: Arc<BlockSnapshot>) {
        *self.latest.write().await = Some(block.clone());
        self.history.record(&block).await;

        let fans = self.fans().await;
        for fan in &fans {
            fan.deliver(block.clone()).await;
        }
        let _ = self.funder_blocks.send(block.clone());

        let triggered = {
            let mut condition = self.stop_condition.lock().await;
            let met = condition.is_met(block.number, Instant::now());
            if met {
                *condition = StopCondition::default();
            }
            met
        };

        if triggered {
            info!("Stop condition reached at block {}", block.number);
            self.stop_all().await;
        }
    }
}
