//! Durable swap registry and ingestion checkpoints
//!
//! Handles:
//! - Swap lifecycle persistence keyed by hash lock
//! - Block checkpoints for restart recovery
//! - Processed-event dedup keys
//! - Dynamically watched HTLC contracts

mod memory;
mod postgres;
pub mod swap;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use swap::{LockRecord, PreimageOutcome, Swap, SwapFlag, SwapSlot, SwapStatus, UpsertOutcome};

use crate::error::RelayerResult;
use crate::hashlock::{ChainId, HashLock, Preimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde::Serialize;
use std::collections::BTreeMap;

/// Identity of a log entry across replays: (chain, tx hash, log index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub chain_id: ChainId,
    pub tx_hash: H256,
    pub log_index: u64,
}

/// Category of on-chain action the relayer performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Unlock,
    Refund,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Unlock => "unlock",
            ActionKind::Refund => "refund",
        }
    }

    /// Status held while the action is outstanding
    pub fn pending_status(&self) -> SwapStatus {
        match self {
            ActionKind::Unlock => SwapStatus::Relaying,
            ActionKind::Refund => SwapStatus::Refunding,
        }
    }

    /// Status reached once the action is confirmed
    pub fn terminal_status(&self) -> SwapStatus {
        match self {
            ActionKind::Unlock => SwapStatus::Relayed,
            ActionKind::Refund => SwapStatus::Refunded,
        }
    }
}

/// A broadcast unlock/refund transaction
#[derive(Debug, Clone)]
pub struct Submission {
    pub action_id: uuid::Uuid,
    pub hash_lock: HashLock,
    pub kind: ActionKind,
    pub chain_id: ChainId,
    pub tx_hash: H256,
}

/// Swap counts per status
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwapStats {
    pub by_status: BTreeMap<String, u64>,
    pub flagged: u64,
}

/// Single source of truth for swap lifecycle state.
///
/// Every write is atomic with respect to one hash lock; nothing spans swaps.
#[async_trait]
pub trait SwapRegistry: Send + Sync {
    /// Create the swap if absent; learn the counter HTLC on a mirrored lock
    async fn upsert_on_lock(&self, record: LockRecord) -> RelayerResult<UpsertOutcome>;

    /// Set the preimage exactly once; `Conflict` on a different value
    async fn record_preimage(
        &self,
        hash_lock: HashLock,
        preimage: Preimage,
    ) -> RelayerResult<PreimageOutcome>;

    /// Compare-and-swap status update; `StaleState` when `from` no longer matches
    async fn transition(
        &self,
        hash_lock: HashLock,
        from: SwapStatus,
        to: SwapStatus,
    ) -> RelayerResult<Swap>;

    async fn get(&self, hash_lock: HashLock) -> RelayerResult<Option<Swap>>;

    /// Resolve an HTLC contract to the swap it escrows
    async fn find_by_htlc(&self, chain: ChainId, htlc: Address) -> RelayerResult<Option<HashLock>>;

    /// Every swap not in a terminal status
    async fn list_pending(&self) -> RelayerResult<Vec<Swap>>;

    async fn list(&self, status: Option<SwapStatus>, limit: usize) -> RelayerResult<Vec<Swap>>;

    /// Bump `attempt_count` and `last_relay_attempt`; returns the new count
    async fn record_attempt(&self, hash_lock: HashLock) -> RelayerResult<u32>;

    async fn record_submission(&self, submission: &Submission) -> RelayerResult<()>;

    /// Most recent broadcast of `kind` for the swap, possibly still pending
    async fn last_submission(
        &self,
        hash_lock: HashLock,
        kind: ActionKind,
    ) -> RelayerResult<Option<Submission>>;

    async fn flag(&self, hash_lock: HashLock, flag: SwapFlag, message: String) -> RelayerResult<()>;

    /// Re-arm a flagged swap. Preimage conflicts stay frozen.
    async fn clear_flag(&self, hash_lock: HashLock) -> RelayerResult<Swap>;

    /// Mark terminal swaps last updated before `before` as archived
    async fn archive_terminal(&self, before: DateTime<Utc>) -> RelayerResult<u64>;

    async fn stats(&self) -> RelayerResult<SwapStats>;

    async fn health_check(&self) -> RelayerResult<()>;
}

/// Ingestion bookkeeping that must survive restarts.
///
/// Checkpoints and processed keys belong to one shard: instances sharing a
/// store each read every log but act only on their own hash locks.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, shard: u64, chain_id: ChainId) -> RelayerResult<Option<u64>>;

    async fn save_checkpoint(
        &self,
        shard: u64,
        chain_id: ChainId,
        block_number: u64,
    ) -> RelayerResult<()>;

    async fn is_processed(&self, shard: u64, key: &EventKey) -> RelayerResult<bool>;

    async fn mark_processed(&self, shard: u64, key: &EventKey) -> RelayerResult<()>;

    async fn watch_contract(
        &self,
        chain_id: ChainId,
        address: Address,
        from_block: u64,
    ) -> RelayerResult<()>;

    async fn watched_contracts(&self, chain_id: ChainId) -> RelayerResult<Vec<(Address, u64)>>;
}
