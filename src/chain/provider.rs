//! Ethers-backed chain port with multi-RPC failover and WebSocket head subscriptions

use super::{BlockHeader, BlockSnapshot, ChainPort, HeaderStream};
use crate::config::ChainConfig;
use crate::error::{FanError, FanResult};

use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError, Ws};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockId, BlockNumber, Bytes, TxHash, H256, U256};
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// Multi-provider wrapper with automatic failover
pub struct EthChain {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// WebSocket provider used for head subscriptions
    ws_provider: RwLock<Option<Provider<Ws>>>,
}

impl EthChain {
    /// Connect to the configured endpoints
    pub async fn new(config: ChainConfig) -> FanResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    http_providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => warn!("Failed to create provider for {}: {}", url, e),
            }
        }

        if http_providers.is_empty() {
            return Err(FanError::ChainConnection(format!(
                "no valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        let ws_provider = match Provider::<Ws>::connect(config.ws_url.as_str()).await {
            Ok(provider) => {
                info!("WebSocket connected for chain {}", config.chain_id);
                Some(provider)
            }
            Err(e) => {
                warn!(
                    "WebSocket connection failed for chain {}: {} (will retry on subscribe)",
                    config.chain_id, e
                );
                None
            }
        };

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            ws_provider: RwLock::new(ws_provider),
        })
    }

    /// Get the active HTTP provider
    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Reconnect WebSocket
    async fn reconnect_ws(&self) -> FanResult<Provider<Ws>> {
        let provider = Provider::<Ws>::connect(self.config.ws_url.as_str())
            .await
            .map_err(|e| {
                FanError::ChainConnection(format!("WebSocket reconnection failed: {}", e))
            })?;
        *self.ws_provider.write().await = Some(provider.clone());
        info!("WebSocket reconnected for chain {}", self.config.chain_id);
        Ok(provider)
    }

    async fn get_block<T: Into<BlockId> + Send + Sync>(
        &self,
        id: T,
    ) -> FanResult<Option<BlockSnapshot>> {
        let id: BlockId = id.into();
        for _ in 0..self.http_providers.len() {
            match self.http().get_block(id).await {
                Ok(block) => return Ok(block.as_ref().and_then(BlockSnapshot::from_ethers)),
                Err(e) => {
                    warn!("Failed to get block {:?} from chain {}: {}", id, self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(FanError::ChainConnection(format!(
            "all providers failed to return block {:?}",
            id
        )))
    }
}

/// Classify a node's rejection of a transaction
pub fn classify_send_error(error: &ProviderError) -> FanError {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("insufficient funds") {
        FanError::InsufficientFunds(message)
    } else if lower.contains("nonce too low") {
        FanError::NonceTooLow(message)
    } else {
        FanError::Rpc(message)
    }
}

#[async_trait]
impl ChainPort for EthChain {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn send_raw_transaction(&self, signed: Bytes) -> FanResult<TxHash> {
        let pending = self
            .http()
            .send_raw_transaction(signed)
            .await
            .map_err(|e| classify_send_error(&e))?;
        Ok(pending.tx_hash())
    }

    async fn pending_nonce_at(&self, address: Address) -> FanResult<u64> {
        let nonce = self
            .http()
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| FanError::Rpc(e.to_string()))?;
        Ok(nonce.as_u64())
    }

    async fn balance_at(&self, address: Address) -> FanResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| FanError::Rpc(e.to_string()))
    }

    async fn suggest_tip_cap(&self) -> FanResult<U256> {
        self.http()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| FanError::GasEstimation(e.to_string()))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> FanResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| FanError::GasEstimation(e.to_string()))
    }

    async fn block_by_hash(&self, hash: H256) -> FanResult<Option<BlockSnapshot>> {
        self.get_block(hash).await
    }

    async fn block_by_number(&self, number: Option<u64>) -> FanResult<Option<BlockSnapshot>> {
        match number {
            Some(number) => self.get_block(number).await,
            None => self.get_block(BlockNumber::Latest).await,
        }
    }

    async fn subscribe_new_heads(&self) -> FanResult<HeaderStream> {
        let ws = match self.ws_provider.read().await.clone() {
            Some(ws) => ws,
            None => self.reconnect_ws().await?,
        };

        let (header_tx, header_rx) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        let chain_id = self.config.chain_id;

        // The subscription borrows the provider, so it lives in its own task
        tokio::spawn(async move {
            let mut heads = match ws.subscribe_blocks().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(FanError::Subscription(e.to_string())));
                    return;
                }
            };

            while let Some(block) = heads.next().await {
                let Some(header) = BlockHeader::from_ethers(&block) else {
                    debug!("Chain {}: skipping header without hash or number", chain_id);
                    continue;
                };
                if header_tx.unbounded_send(Ok(header)).is_err() {
                    // watcher dropped the stream
                    return;
                }
            }

            let _ = header_tx.unbounded_send(Err(FanError::Subscription(
                "head subscription closed by node".to_string(),
            )));
        });

        let subscribed = ready_rx
            .await
            .map_err(|_| FanError::Subscription("subscription task exited".to_string()))?;

        if let Err(e) = subscribed {
            // Drop the socket so the next attempt reconnects
            *self.ws_provider.write().await = None;
            return Err(e);
        }

        Ok(header_rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_send_errors() {
        let funds = ProviderError::CustomError(
            "insufficient funds for gas * price + value: have 0 want 21000".to_string(),
        );
        assert!(matches!(classify_send_error(&funds), FanError::InsufficientFunds(_)));

        let nonce = ProviderError::CustomError("nonce too low: next nonce 5, tx nonce 4".into());
        assert!(matches!(classify_send_error(&nonce), FanError::NonceTooLow(_)));

        let known = ProviderError::CustomError("already known".into());
        // still in the pool, not mined
        assert!(matches!(classify_send_error(&known), FanError::Rpc(_)));

        let other = ProviderError::CustomError("replacement transaction underpriced".into());
        assert!(matches!(classify_send_error(&other), FanError::Rpc(_)));
    }
}
