//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent actions never reuse a nonce
//! - Releasing nonces of transactions that never reached the mempool
//! - Re-syncing with the chain after a nonce conflict

use crate::chain::ChainProvider;
use crate::error::RelayerResult;
use crate::hashlock::ChainId;

use ethers::types::{Address, H256};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Local view of the wallet's nonces on one chain
#[derive(Debug, Default)]
pub(crate) struct NonceState {
    /// Next nonce to hand out; `None` until first synced
    next: Option<u64>,
    /// Broadcast, unconfirmed: nonce -> tx hash
    pending: BTreeMap<u64, H256>,
}

impl NonceState {
    pub(crate) fn allocate(&mut self, on_chain: u64) -> u64 {
        let nonce = self.next.unwrap_or(on_chain).max(on_chain);
        self.next = Some(nonce + 1);
        nonce
    }

    pub(crate) fn mark_pending(&mut self, nonce: u64, tx_hash: H256) {
        self.pending.insert(nonce, tx_hash);
    }

    /// Give back a nonce whose transaction was never broadcast
    pub(crate) fn release(&mut self, nonce: u64) {
        self.pending.remove(&nonce);
        if self.next == Some(nonce + 1) {
            self.next = Some(nonce);
        }
    }

    pub(crate) fn confirm(&mut self, tx_hash: H256) {
        self.pending.retain(|_, hash| *hash != tx_hash);
    }

    pub(crate) fn resync(&mut self, on_chain: u64) {
        self.pending.retain(|nonce, _| *nonce >= on_chain);
        let floor = self
            .pending
            .keys()
            .next_back()
            .map(|n| n + 1)
            .unwrap_or(on_chain)
            .max(on_chain);
        if self.next != Some(floor) {
            warn!("Nonce re-synced: {:?} -> {}", self.next, floor);
        }
        self.next = Some(floor);
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Manages nonces of the relayer wallet on one chain
pub struct NonceManager {
    chain_id: ChainId,
    wallet_address: Address,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(chain_id: ChainId, wallet_address: Address) -> Self {
        Self {
            chain_id,
            wallet_address,
            state: Mutex::new(NonceState::default()),
        }
    }

    /// Get the next nonce
    pub async fn allocate(&self, provider: &ChainProvider) -> RelayerResult<u64> {
        let mut state = self.state.lock().await;
        let on_chain = match state.next {
            Some(next) => next,
            None => provider.get_transaction_count(self.wallet_address).await?,
        };
        let nonce = state.allocate(on_chain);

        debug!("Allocated nonce {} for chain {}", nonce, self.chain_id);
        Ok(nonce)
    }

    pub async fn mark_pending(&self, nonce: u64, tx_hash: H256) {
        self.state.lock().await.mark_pending(nonce, tx_hash);
    }

    pub async fn release(&self, nonce: u64) {
        self.state.lock().await.release(nonce);
    }

    pub async fn confirm(&self, tx_hash: H256) {
        self.state.lock().await.confirm(tx_hash);
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, provider: &ChainProvider) -> RelayerResult<()> {
        let on_chain = provider.get_transaction_count(self.wallet_address).await?;
        self.state.lock().await.resync(on_chain);
        Ok(())
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending_count()
    }
}
