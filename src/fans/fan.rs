//! The canonical agent: one wallet, one block loop

use super::{Agent, FanReport};
use crate::chain::{BlockSnapshot, ChainPort};
use crate::error::FanResult;
use crate::tx::{CrazedLevel, Wallet};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long `stop` waits for the block loop before aborting it
const STOP_GRACE: Duration = Duration::from_secs(5);

type BlockSender = mpsc::UnboundedSender<Arc<BlockSnapshot>>;

/// Running block loop
struct SearchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Fan {
    id: Uuid,
    level: CrazedLevel,
    wallet: Arc<Wallet>,
    reports: Option<mpsc::UnboundedSender<FanReport>>,
    searching: AtomicBool,
    /// Feeds the block loop; never held across an await
    blocks: std::sync::Mutex<Option<BlockSender>>,
    search: Mutex<Option<SearchHandle>>,
}

impl Fan {
    /// Wrap an existing wallet. `level` should already be resolved.
    pub fn new(
        level: CrazedLevel,
        wallet: Wallet,
        reports: Option<mpsc::UnboundedSender<FanReport>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            wallet: Arc::new(wallet),
            reports,
            searching: AtomicBool::new(false),
            blocks: std::sync::Mutex::new(None),
            search: Mutex::new(None),
        }
    }

    /// Create a fan with a fresh key; `Mixed` picks a random level
    pub async fn recruit(
        name: impl Into<String>,
        level: CrazedLevel,
        chain: Arc<dyn ChainPort>,
        reports: Option<mpsc::UnboundedSender<FanReport>>,
    ) -> FanResult<Self> {
        let level = level.resolve();
        let wallet = Wallet::random(name, chain, level.policy()).await?;
        Ok(Self::new(level, wallet, reports))
    }

    fn block_sender(&self) -> MutexGuard<'_, Option<BlockSender>> {
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Agent for Fan {
    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        self.wallet.name()
    }

    fn address(&self) -> Address {
        self.wallet.address()
    }

    fn level(&self) -> CrazedLevel {
        self.level
    }

    fn wallet(&self) -> &Arc<Wallet> {
        &self.wallet
    }

    async fn start(&self) {
        let mut search = self.search.lock().await;
        if search.is_some() {
            return;
        }

        let (blocks, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(search_loop(
            SearchContext {
                id: self.id,
                wallet: self.wallet.clone(),
                reports: self.reports.clone(),
            },
            receiver,
            cancel.clone(),
        ));

        *self.block_sender() = Some(blocks);
        *search = Some(SearchHandle { cancel, task });
        self.searching.store(true, Ordering::SeqCst);
        crate::metrics::record_fan_started();
        info!("{} ({}) is searching", self.name(), self.level);
    }

    async fn stop(&self) {
        let mut search = self.search.lock().await;
        let Some(handle) = search.take() else {
            return;
        };

        self.block_sender().take();
        handle.cancel.cancel();
        let mut task = handle.task;
        match tokio::time::timeout(STOP_GRACE, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}: block loop ended abnormally: {}", self.name(), e),
            Err(_) => {
                warn!("{}: block loop did not exit within {:?}, aborting", self.name(), STOP_GRACE);
                task.abort();
            }
        }

        self.searching.store(false, Ordering::SeqCst);
        crate::metrics::record_fan_stopped();
        info!("{} stopped searching", self.name());
    }

    fn is_searching(&self) -> bool {
        self.searching.load(Ordering::SeqCst)
    }

    async fn deliver(&self, block: Arc<BlockSnapshot>) {
        if let Some(blocks) = self.block_sender().as_ref() {
            let _ = blocks.send(block);
        }
    }
}

struct SearchContext {
    id: Uuid,
    wallet: Arc<Wallet>,
    reports: Option<mpsc::UnboundedSender<FanReport>>,
}

async fn search_loop(
    ctx: SearchContext,
    mut blocks: mpsc::UnboundedReceiver<Arc<BlockSnapshot>>,
    cancel: CancellationToken,
) {
    let wallet = &ctx.wallet;

    loop {
        let block = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            block = blocks.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };

        let pending = wallet.reconcile(&block).await;
        if cancel.is_cancelled() {
            break;
        }
        if pending >= wallet.policy().max_pending_transactions {
            debug!("{}: {} pending at block {}, waiting", wallet.name(), pending, block.number);
            continue;
        }

        match wallet.submit(random_recipient(), U256::one()).await {
            Ok(hash) => debug!("{}: new transaction {:?} at block {}", wallet.name(), hash, block.number),
            Err(e) if e.is_insufficient_funds() => {
                warn!("{}: out of funds: {}", wallet.name(), e);
                if let Some(reports) = &ctx.reports {
                    let _ = reports.send(FanReport::OutOfFunds {
                        fan_id: ctx.id,
                        name: wallet.name().to_string(),
                        address: wallet.address(),
                    });
                }
            }
            Err(e) if e.is_retryable() => {
                debug!("{}: submission failed, retrying next block: {}", wallet.name(), e)
            }
            Err(e) => warn!("{}: submission failed: {}", wallet.name(), e),
        }
    }

    debug!("{}: block loop exited", wallet.name());
}

fn random_recipient() -> Address {
    Address::from(rand::random::<[u8; 20]>())
}
