//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::ChainId;

use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    chain_id: ChainId,
    gas_price_strategy: GasPriceStrategy,
    max_gas_price_gwei: u64,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: &ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::Config(format!(
                "No valid RPC providers for chain {}",
                config.chain_id
            )));
        }

        let initial_block = http_providers[0]
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .unwrap_or(0);

        Ok(Self {
            chain_id: config.chain_id,
            gas_price_strategy: config.gas_price_strategy.clone(),
            max_gas_price_gwei: config.max_gas_price_gwei,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(initial_block),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run a read-only call against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, operation: &str, call: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last_error = String::new();

        for _ in 0..self.http_providers.len() {
            match call(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!("Failed to {} on chain {}: {}", operation, self.chain_id, e);
                    last_error = e.to_string();
                    self.failover();
                }
            }
        }

        Err(RelayerError::TransientNetwork {
            chain_id: self.chain_id,
            message: format!("all providers failed to {}: {}", operation, last_error),
        })
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        let block = self
            .with_failover("get block number", |p| async move { p.get_block_number().await })
            .await?
            .as_u64();
        *self.last_block.write().await = block;
        Ok(block)
    }

    /// Last head seen by [`Self::get_block_number`]
    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    /// Canonical hash of a block
    pub async fn get_block_hash(&self, block_number: u64) -> RelayerResult<Option<H256>> {
        let block = self
            .with_failover("get block", |p| async move { p.get_block(block_number).await })
            .await?;
        Ok(block.and_then(|b| b.hash))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        self.with_failover("get logs", |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.with_failover("get receipt", |p| async move {
            p.get_transaction_receipt(tx_hash).await
        })
        .await
    }

    /// Pending-inclusive transaction count of `address`
    pub async fn get_transaction_count(&self, address: Address) -> RelayerResult<u64> {
        let count = self
            .with_failover("get transaction count", |p| async move {
                p.get_transaction_count(address, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(count.as_u64())
    }

    /// Read-only contract call. Reverts are not retried on other providers.
    pub async fn call(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        self.http()
            .call(tx, None)
            .await
            .map_err(|e| classify_rpc_error(self.chain_id, &e.to_string()))
    }

    /// Estimate gas for a transaction
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| classify_rpc_error(self.chain_id, &e.to_string()))
    }

    /// Broadcast a signed transaction on the active provider
    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let err = classify_rpc_error(self.chain_id, &e.to_string());
                if err.is_retryable() {
                    self.failover();
                }
                Err(err)
            }
        }
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        let cap = U256::from(self.max_gas_price_gwei) * U256::exp10(9);

        match self.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .with_failover("get gas price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(std::cmp::min(price, cap)))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees(cap).await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn latest_block(&self) -> RelayerResult<Block<TxHash>> {
        self.with_failover("get latest block", |p| async move {
            p.get_block(BlockNumber::Latest).await
        })
        .await?
        .ok_or_else(|| RelayerError::TransientNetwork {
            chain_id: self.chain_id,
            message: "no latest block".to_string(),
        })
    }

    /// Timestamp of the latest block, in seconds
    pub async fn get_latest_timestamp(&self) -> RelayerResult<u64> {
        Ok(self.latest_block().await?.timestamp.as_u64())
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self, cap: U256) -> RelayerResult<(U256, U256)> {
        let block = self.latest_block().await?;

        let base_fee = block.base_fee_per_gas.unwrap_or_default();
        let priority_fee = std::cmp::min(U256::from(1_500_000_000u64), cap);

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = std::cmp::min(base_fee * 2 + priority_fee, cap);

        Ok((max_fee, priority_fee))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

/// Map an RPC error message onto the relayer's error taxonomy
pub fn classify_rpc_error(chain_id: ChainId, message: &str) -> RelayerError {
    let lower = message.to_ascii_lowercase();

    if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("replacement transaction underpriced")
        || lower.contains("already known")
    {
        RelayerError::NonceConflict {
            chain_id,
            message: message.to_string(),
        }
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        RelayerError::ContractRevert {
            chain_id,
            reason: message.to_string(),
        }
    } else {
        RelayerError::TransientNetwork {
            chain_id,
            message: message.to_string(),
        }
    }
}
