//! Chain head watcher with full-block resolution and automatic resubscription

use super::{BlockHeader, BlockSnapshot, ChainPort, HeaderStream};
use crate::error::{FanError, FanResult};

use async_trait::async_trait;
use ethers::types::H256;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How many delivered block hashes are remembered to suppress replays
const SEEN_BLOCKS: usize = 128;

/// Receives every resolved block, in arrival order
#[async_trait]
pub trait BlockSink: Send + Sync {
    async fn on_block(&self, block: Arc<BlockSnapshot>);
}

/// Single subscription to the chain head for the whole process
pub struct ChainWatcher {
    chain: Arc<dyn ChainPort>,
    sink: Arc<dyn BlockSink>,
    resubscribe_delay: Duration,
}

impl ChainWatcher {
    pub fn new(
        chain: Arc<dyn ChainPort>,
        sink: Arc<dyn BlockSink>,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            chain,
            sink,
            resubscribe_delay,
        }
    }

    /// Run the watch loop on its own task until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.watch(cancel).await })
    }

    /// Main watch loop. Subscription failures are logged and retried; this
    /// only returns once `cancel` fires.
    pub async fn watch(&self, cancel: CancellationToken) {
        let mut seen = VecDeque::with_capacity(SEEN_BLOCKS);

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                subscribed = self.chain.subscribe_new_heads() => subscribed,
            };

            match subscribed {
                Ok(heads) => {
                    info!("Subscribed to new heads on chain {}", self.chain.chain_id());
                    match self.drain(heads, &cancel, &mut seen).await {
                        Ok(()) => break,
                        Err(e) => {
                            warn!("Head subscription lost: {}. Re-subscribing...", e);
                            crate::metrics::record_subscription_error();
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to subscribe to new heads: {}. Retrying...", e);
                    crate::metrics::record_subscription_error();
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.resubscribe_delay) => {}
            }
        }

        info!("Chain watcher stopped");
    }

    /// Consume one subscription. `Ok` means cancelled, `Err` means the stream broke.
    async fn drain(
        &self,
        mut heads: HeaderStream,
        cancel: &CancellationToken,
        seen: &mut VecDeque<H256>,
    ) -> FanResult<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = heads.next() => next,
            };

            match next {
                Some(Ok(header)) => self.handle_header(header, seen).await,
                Some(Err(e)) => return Err(e),
                None => return Err(FanError::Subscription("head stream ended".to_string())),
            }
        }
    }

    /// Resolve the full block for a header and hand it to the sink
    async fn handle_header(&self, header: BlockHeader, seen: &mut VecDeque<H256>) {
        if seen.contains(&header.hash) {
            debug!("Block {} ({:?}) already delivered, skipping", header.number, header.hash);
            return;
        }

        debug!(
            "New header {} ({:?}), gas used {} of {}",
            header.number, header.hash, header.gas_used, header.gas_limit
        );

        // Wallets reconcile against the full transaction list
        let block = match self.chain.block_by_hash(header.hash).await {
            Ok(Some(block)) => block,
            Ok(None) => {
                warn!("Block {} ({:?}) not found, skipping", header.number, header.hash);
                return;
            }
            Err(e) => {
                error!(
                    "Error getting block {} ({:?}) from header: {}",
                    header.number, header.hash, e
                );
                return;
            }
        };

        if seen.len() == SEEN_BLOCKS {
            seen.pop_front();
        }
        seen.push_back(header.hash);

        crate::metrics::record_block(block.number);
        self.sink.on_block(Arc::new(block)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChainPort;
    use crate::testing::MockChain;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct RecordingSink {
        blocks: mpsc::UnboundedSender<Arc<BlockSnapshot>>,
    }

    #[async_trait]
    impl BlockSink for RecordingSink {
        async fn on_block(&self, block: Arc<BlockSnapshot>) {
            let _ = self.blocks.send(block);
        }
    }

    fn start(
        chain: Arc<dyn ChainPort>,
    ) -> (
        CancellationToken,
        JoinHandle<()>,
        mpsc::UnboundedReceiver<Arc<BlockSnapshot>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(RecordingSink { blocks: tx });
        let cancel = CancellationToken::new();
        let handle =
            ChainWatcher::new(chain, sink, Duration::from_millis(10)).spawn(cancel.clone());
        (cancel, handle, rx)
    }

    async fn next_block(rx: &mut mpsc::UnboundedReceiver<Arc<BlockSnapshot>>) -> u64 {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("block delivered in time")
            .expect("sink open")
            .number
    }

    #[tokio::test]
    async fn test_delivers_blocks_in_order() {
        let chain = Arc::new(MockChain::new(1337));
        let (cancel, handle, mut rx) = start(chain.clone());
        chain.wait_for_subscribers(1).await;

        for _ in 0..3 {
            chain.mine_and_announce();
        }

        assert_eq!(next_block(&mut rx).await, 1);
        assert_eq!(next_block(&mut rx).await, 2);
        assert_eq!(next_block(&mut rx).await, 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_replayed_header_is_delivered_once() {
        let chain = Arc::new(MockChain::new(1337));
        let (cancel, handle, mut rx) = start(chain.clone());
        chain.wait_for_subscribers(1).await;

        let block = chain.mine();
        chain.announce(&block);
        chain.announce(&block);
        chain.mine_and_announce();

        assert_eq!(next_block(&mut rx).await, 1);
        assert_eq!(next_block(&mut rx).await, 2);

        cancel.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_error() {
        let chain = Arc::new(MockChain::new(1337));
        chain.fail_subscriptions(1);
        let (cancel, handle, mut rx) = start(chain.clone());

        chain.wait_for_subscribers(1).await;
        chain.mine_and_announce();
        assert_eq!(next_block(&mut rx).await, 1);

        chain.break_subscriptions();
        chain.wait_for_subscribers(1).await;
        chain.mine_and_announce();
        assert_eq!(next_block(&mut rx).await, 2);

        // one failed subscribe, the first stream, and the replacement stream
        assert_eq!(chain.subscribe_calls(), 3);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_block_is_skipped() {
        let mut port = MockChainPort::new();
        port.expect_chain_id().return_const(1u64);
        port.expect_subscribe_new_heads().returning(|| {
            let headers = vec![
                Ok(BlockHeader {
                    hash: H256::from_low_u64_be(1),
                    number: 1,
                    base_fee: 7.into(),
                    gas_used: 0.into(),
                    gas_limit: 0.into(),
                }),
                Ok(BlockHeader {
                    hash: H256::from_low_u64_be(2),
                    number: 2,
                    base_fee: 7.into(),
                    gas_used: 0.into(),
                    gas_limit: 0.into(),
                }),
            ];
            Ok(futures::stream::iter(headers)
                .chain(futures::stream::pending())
                .boxed())
        });
        port.expect_block_by_hash().returning(|hash| {
            if hash == H256::from_low_u64_be(1) {
                Ok(None)
            } else {
                Ok(Some(BlockSnapshot {
                    hash,
                    number: 2,
                    base_fee: 7.into(),
                    gas_used: 0.into(),
                    gas_limit: 0.into(),
                    transactions: vec![],
                }))
            }
        });

        let (cancel, handle, mut rx) = start(Arc::new(port));
        assert_eq!(next_block(&mut rx).await, 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
