//! Chain module - the relayer's only contact with the two blockchains
//!
//! This module provides:
//! - The [`ChainGateway`] abstraction used by ingestion and the executor
//! - Multi-RPC provider management with automatic failover
//! - Polling event subscriptions over a growable watch set
//! - Confirmation-depth buffering with reorg detection

pub mod finality;
pub mod gateway;
pub mod provider;
pub mod subscription;
#[cfg(test)]
pub(crate) mod testing;

pub use finality::ConfirmationBuffer;
pub use gateway::EvmGateway;
pub use provider::{ChainProvider, GasPrice};
pub use subscription::{ChainBatch, EventSubscription, WatchSet};

use crate::config::{ChainConfig, Settings, TimeLockKind};
use crate::error::{RelayerError, RelayerResult};
use crate::events::RawEvent;
use crate::hashlock::{ChainId, Preimage};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Function invoked on an HTLC contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcMethod {
    Unlock { preimage: Preimage },
    Refund,
}

impl HtlcMethod {
    pub fn name(&self) -> &'static str {
        match self {
            HtlcMethod::Unlock { .. } => "unlock",
            HtlcMethod::Refund => "refund",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcCall {
    pub contract: Address,
    pub method: HtlcMethod,
}

/// A mined transaction with enough confirmations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
    pub gas_used: Option<U256>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HtlcState {
    Open,
    Unlocked,
    Refunded,
}

/// On-chain view of one HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HtlcInfo {
    pub receiver: Option<Address>,
    pub state: HtlcState,
}

/// Blockchain access for a single chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainGateway: Send + Sync {
    fn chain_id(&self) -> ChainId;

    async fn current_block_height(&self) -> RelayerResult<u64>;

    /// Timestamp of the chain's latest block; timestamp time locks are judged against it
    async fn latest_block_timestamp(&self) -> RelayerResult<u64>;

    /// Canonical block hash at `number`, `None` if the chain has no such block yet
    async fn block_hash(&self, number: u64) -> RelayerResult<Option<H256>>;

    /// Decoded HTLC and factory logs emitted by `addresses` in `[from, to]`
    async fn fetch_events(
        &self,
        addresses: Vec<Address>,
        from: u64,
        to: u64,
    ) -> RelayerResult<Vec<RawEvent>>;

    /// Build, sign and broadcast; returns the transaction hash
    async fn submit_transaction(&self, call: HtlcCall) -> RelayerResult<H256>;

    /// `Timeout` when `confirmations` are not reached in time,
    /// `ContractRevert` when the transaction was mined but failed
    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> RelayerResult<TxReceipt>;

    /// Re-read settlement state of an HTLC
    async fn htlc_info(&self, htlc: Address) -> RelayerResult<HtlcInfo>;
}

/// Static per-chain parameters resolved from configuration
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub chain_id: ChainId,
    pub name: String,
    pub confirmation_depth: u64,
    pub tx_confirmations: u64,
    pub time_lock_kind: TimeLockKind,
    pub poll_interval: Duration,
    pub max_block_range: u64,
    pub start_block: u64,
    pub factories: Vec<Address>,
    pub htlcs: Vec<Address>,
}

impl ChainParams {
    pub fn from_config(config: &ChainConfig) -> RelayerResult<Self> {
        Ok(Self {
            chain_id: config.chain_id,
            name: config.name.clone(),
            confirmation_depth: config.confirmation_depth(),
            tx_confirmations: config.tx_confirmations.max(1),
            time_lock_kind: config.time_lock_kind,
            poll_interval: config.poll_interval(),
            max_block_range: config.max_block_range.max(1),
            start_block: config.start_block,
            factories: parse_addresses(&config.factory_addresses)?,
            htlcs: parse_addresses(&config.htlc_addresses)?,
        })
    }
}

/// Blank entries (an unset `${VAR}`) are skipped
fn parse_addresses(raw: &[String]) -> RelayerResult<Vec<Address>> {
    raw.iter()
        .filter(|a| !a.trim().is_empty())
        .map(|a| {
            a.parse::<Address>()
                .map_err(|e| RelayerError::Config(format!("Invalid contract address {}: {}", a, e)))
        })
        .collect()
}

struct ChainEntry {
    params: ChainParams,
    gateway: Arc<dyn ChainGateway>,
}

/// The pair of chains a swap spans
pub struct ChainManager {
    chains: DashMap<ChainId, ChainEntry>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            chains: DashMap::new(),
        }
    }

    /// Connect an [`EvmGateway`] for every enabled chain
    pub async fn connect(settings: &Settings) -> RelayerResult<Self> {
        let wallet = gateway::load_wallet(&settings.wallet)?;
        let manager = Self::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let params = ChainParams::from_config(chain_config)?;
            let provider = Arc::new(ChainProvider::new(chain_config).await?);
            let gateway = EvmGateway::new(provider, wallet.clone(), params.poll_interval).await?;
            manager.register(params, Arc::new(gateway));

            info!("Chain {} initialized successfully", chain_config.name);
        }

        Ok(manager)
    }

    pub fn register(&self, params: ChainParams, gateway: Arc<dyn ChainGateway>) {
        self.chains
            .insert(params.chain_id, ChainEntry { params, gateway });
    }

    pub fn gateway(&self, chain_id: ChainId) -> RelayerResult<Arc<dyn ChainGateway>> {
        self.chains
            .get(&chain_id)
            .map(|c| c.gateway.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    pub fn params(&self, chain_id: ChainId) -> RelayerResult<ChainParams> {
        self.chains
            .get(&chain_id)
            .map(|c| c.params.clone())
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    /// The other chain of the pair
    pub fn counterpart(&self, chain_id: ChainId) -> RelayerResult<ChainId> {
        if !self.chains.contains_key(&chain_id) {
            return Err(RelayerError::ChainNotFound { chain_id });
        }
        self.chains
            .iter()
            .map(|c| *c.key())
            .find(|id| *id != chain_id)
            .ok_or(RelayerError::ChainNotFound { chain_id })
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.iter().map(|c| *c.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Head height per chain; `None` for unreachable chains
    pub async fn health_check(&self) -> Vec<(ChainId, Option<u64>)> {
        let mut results = Vec::new();

        for chain_id in self.chain_ids() {
            let head = match self.gateway(chain_id) {
                Ok(gateway) => gateway.current_block_height().await.ok(),
                Err(_) => None,
            };
            crate::metrics::record_chain_health(chain_id, head.is_some());
            results.push((chain_id, head));
        }

        results
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}
