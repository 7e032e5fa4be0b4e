//! In-process store backed by `DashMap`
//!
//! Used by tests and single-process development runs. Nothing survives a
//! restart, so production deployments use [`super::PgStore`].

use super::{
    ActionKind, CheckpointStore, EventKey, LockRecord, PreimageOutcome, Submission, Swap,
    SwapFlag, SwapRegistry, SwapSlot, SwapStats, SwapStatus, UpsertOutcome,
};
use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{ChainId, HashLock, Preimage};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use ethers::types::Address;
use std::sync::Mutex;

#[derive(Default)]
pub struct MemoryStore {
    /// One slot per hash lock; the entry lock is the per-swap lock
    slots: DashMap<HashLock, SwapSlot>,
    /// (chain, htlc address) -> hash lock
    htlc_index: DashMap<(ChainId, Address), HashLock>,
    submissions: Mutex<Vec<Submission>>,
    checkpoints: DashMap<(u64, ChainId), u64>,
    processed: DashSet<(u64, EventKey)>,
    watched: DashMap<ChainId, Vec<(Address, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submissions recorded so far
    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn index(&self, swap: &Swap) {
        self.htlc_index
            .insert((swap.origin_chain, swap.origin_htlc), swap.hash_lock);
        if let Some(counter) = swap.counter_htlc {
            self.htlc_index
                .insert((swap.counter_chain, counter), swap.hash_lock);
        }
    }

    fn with_swap<T>(
        &self,
        hash_lock: HashLock,
        f: impl FnOnce(&mut Swap) -> RelayerResult<T>,
    ) -> RelayerResult<T> {
        let mut slot = self
            .slots
            .get_mut(&hash_lock)
            .ok_or(RelayerError::SwapNotFound { hash_lock })?;
        f(slot.swap_mut(hash_lock)?)
    }
}

#[async_trait]
impl SwapRegistry for MemoryStore {
    async fn upsert_on_lock(&self, record: LockRecord) -> RelayerResult<UpsertOutcome> {
        let outcome = self
            .slots
            .entry(record.hash_lock)
            .or_default()
            .apply_lock(&record, Utc::now());
        self.index(outcome.swap());
        Ok(outcome)
    }

    async fn record_preimage(
        &self,
        hash_lock: HashLock,
        preimage: Preimage,
    ) -> RelayerResult<PreimageOutcome> {
        self.slots
            .entry(hash_lock)
            .or_default()
            .apply_preimage(hash_lock, preimage, Utc::now())
    }

    async fn transition(
        &self,
        hash_lock: HashLock,
        from: SwapStatus,
        to: SwapStatus,
    ) -> RelayerResult<Swap> {
        self.with_swap(hash_lock, |swap| {
            swap.advance(from, to, Utc::now())?;
            Ok(swap.clone())
        })
    }

    async fn get(&self, hash_lock: HashLock) -> RelayerResult<Option<Swap>> {
        Ok(self
            .slots
            .get(&hash_lock)
            .and_then(|slot| slot.swap.clone()))
    }

    async fn find_by_htlc(&self, chain: ChainId, htlc: Address) -> RelayerResult<Option<HashLock>> {
        Ok(self.htlc_index.get(&(chain, htlc)).map(|h| *h))
    }

    async fn list_pending(&self) -> RelayerResult<Vec<Swap>> {
        Ok(self
            .slots
            .iter()
            .filter_map(|slot| slot.swap.clone())
            .filter(|swap| !swap.status.is_terminal())
            .collect())
    }

    async fn list(&self, status: Option<SwapStatus>, limit: usize) -> RelayerResult<Vec<Swap>> {
        let mut swaps: Vec<Swap> = self
            .slots
            .iter()
            .filter_map(|slot| slot.swap.clone())
            .filter(|swap| status.map_or(true, |s| swap.status == s))
            .collect();
        swaps.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        swaps.truncate(limit);
        Ok(swaps)
    }

    async fn record_attempt(&self, hash_lock: HashLock) -> RelayerResult<u32> {
        self.with_swap(hash_lock, |swap| {
            swap.attempt_count += 1;
            swap.last_relay_attempt = Some(Utc::now());
            Ok(swap.attempt_count)
        })
    }

    async fn record_submission(&self, submission: &Submission) -> RelayerResult<()> {
        self.submissions
            .lock()
            .map_err(|_| RelayerError::Internal("submission log poisoned".to_string()))?
            .push(submission.clone());
        Ok(())
    }

    async fn last_submission(
        &self,
        hash_lock: HashLock,
        kind: ActionKind,
    ) -> RelayerResult<Option<Submission>> {
        let submissions = self
            .submissions
            .lock()
            .map_err(|_| RelayerError::Internal("submission log poisoned".to_string()))?;
        Ok(submissions
            .iter()
            .rev()
            .find(|s| s.hash_lock == hash_lock && s.kind == kind)
            .cloned())
    }

    async fn flag(&self, hash_lock: HashLock, flag: SwapFlag, message: String) -> RelayerResult<()> {
        self.with_swap(hash_lock, |swap| {
            swap.set_flag(flag, message, Utc::now());
            Ok(())
        })
    }

    async fn clear_flag(&self, hash_lock: HashLock) -> RelayerResult<Swap> {
        self.with_swap(hash_lock, |swap| {
            if swap.is_frozen() {
                return Err(RelayerError::SwapFrozen { hash_lock });
            }
            swap.flag = None;
            swap.updated_at = Utc::now();
            Ok(swap.clone())
        })
    }

    async fn archive_terminal(&self, before: DateTime<Utc>) -> RelayerResult<u64> {
        let mut archived = 0;
        for mut slot in self.slots.iter_mut() {
            if let Some(swap) = slot.swap.as_mut() {
                if swap.status.is_terminal() && !swap.archived && swap.updated_at < before {
                    swap.archived = true;
                    archived += 1;
                }
            }
        }
        Ok(archived)
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let mut stats = SwapStats::default();
        for status in SwapStatus::ALL {
            stats.by_status.insert(status.as_str().to_string(), 0);
        }
        for slot in self.slots.iter() {
            if let Some(swap) = slot.swap.as_ref() {
                *stats
                    .by_status
                    .entry(swap.status.as_str().to_string())
                    .or_default() += 1;
                if swap.flag.is_some() {
                    stats.flagged += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn get_checkpoint(&self, shard: u64, chain_id: ChainId) -> RelayerResult<Option<u64>> {
        Ok(self.checkpoints.get(&(shard, chain_id)).map(|b| *b))
    }

    async fn save_checkpoint(
        &self,
        shard: u64,
        chain_id: ChainId,
        block_number: u64,
    ) -> RelayerResult<()> {
        self.checkpoints.insert((shard, chain_id), block_number);
        Ok(())
    }

    async fn is_processed(&self, shard: u64, key: &EventKey) -> RelayerResult<bool> {
        Ok(self.processed.contains(&(shard, *key)))
    }

    async fn mark_processed(&self, shard: u64, key: &EventKey) -> RelayerResult<()> {
        self.processed.insert((shard, *key));
        Ok(())
    }

    async fn watch_contract(
        &self,
        chain_id: ChainId,
        address: Address,
        from_block: u64,
    ) -> RelayerResult<()> {
        let mut watched = self.watched.entry(chain_id).or_default();
        if !watched.iter().any(|(a, _)| *a == address) {
            watched.push((address, from_block));
        }
        Ok(())
    }

    async fn watched_contracts(&self, chain_id: ChainId) -> RelayerResult<Vec<(Address, u64)>> {
        Ok(self
            .watched
            .get(&chain_id)
            .map(|w| w.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::swap::tests::lock_record;
    use ethers::types::H256;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_duplicate_lock_creates_one_swap() {
        let store = MemoryStore::new();
        let record = lock_record(H256::repeat_byte(1), 1, 2);

        store.upsert_on_lock(record.clone()).await.unwrap();
        store.upsert_on_lock(record).await.unwrap();

        assert_eq!(store.list(None, 10).await.unwrap().len(), 1);
        assert_eq!(
            store
                .find_by_htlc(1, Address::from_low_u64_be(1))
                .await
                .unwrap(),
            Some(H256::repeat_byte(1))
        );
    }

    #[tokio::test]
    async fn test_counter_htlc_is_indexed() {
        let store = MemoryStore::new();
        let hash = H256::repeat_byte(2);
        store.upsert_on_lock(lock_record(hash, 1, 2)).await.unwrap();
        store.upsert_on_lock(lock_record(hash, 2, 1)).await.unwrap();

        assert_eq!(
            store
                .find_by_htlc(2, Address::from_low_u64_be(2))
                .await
                .unwrap(),
            Some(hash)
        );
    }

    #[tokio::test]
    async fn test_transition_missing_swap() {
        let store = MemoryStore::new();
        let err = store
            .transition(H256::zero(), SwapStatus::Locked, SwapStatus::Relaying)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::SwapNotFound { .. }));
    }

    #[tokio::test]
    async fn test_pending_excludes_terminal_and_archive() {
        let store = MemoryStore::new();
        let done = H256::repeat_byte(3);
        let open = H256::repeat_byte(4);
        store.upsert_on_lock(lock_record(done, 1, 2)).await.unwrap();
        store.upsert_on_lock(lock_record(open, 1, 2)).await.unwrap();
        store
            .transition(done, SwapStatus::Locked, SwapStatus::Refunded)
            .await
            .unwrap();

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].hash_lock, open);

        let archived = store
            .archive_terminal(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(archived, 1);
        assert!(store.get(done).await.unwrap().unwrap().archived);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.by_status["refunded"], 1);
        assert_eq!(stats.by_status["locked"], 1);
    }

    #[tokio::test]
    async fn test_clear_flag_keeps_conflicts_frozen() {
        let store = MemoryStore::new();
        let hash = H256::repeat_byte(5);
        store.upsert_on_lock(lock_record(hash, 1, 2)).await.unwrap();

        store
            .flag(hash, SwapFlag::RetriesExhausted, "rpc down".into())
            .await
            .unwrap();
        assert_eq!(store.clear_flag(hash).await.unwrap().flag, None);

        store
            .flag(hash, SwapFlag::PreimageConflict, "two preimages".into())
            .await
            .unwrap();
        assert!(store.clear_flag(hash).await.is_err());
    }

    #[tokio::test]
    async fn test_checkpoints_and_dedup_keys() {
        let store = MemoryStore::new();
        let key = EventKey {
            chain_id: 1,
            tx_hash: H256::repeat_byte(1),
            log_index: 0,
        };

        assert_eq!(assert_ok!(store.get_checkpoint(0, 1).await), None);
        assert_ok!(store.save_checkpoint(0, 1, 42).await);
        assert_eq!(assert_ok!(store.get_checkpoint(0, 1).await), Some(42));
        assert_eq!(assert_ok!(store.get_checkpoint(1, 1).await), None);

        assert!(!assert_ok!(store.is_processed(0, &key).await));
        assert_ok!(store.mark_processed(0, &key).await);
        assert!(assert_ok!(store.is_processed(0, &key).await));
        // another shard has not handled the log yet
        assert!(!assert_ok!(store.is_processed(1, &key).await));

        let htlc = Address::repeat_byte(9);
        store.watch_contract(1, htlc, 10).await.unwrap();
        store.watch_contract(1, htlc, 11).await.unwrap();
        assert_eq!(store.watched_contracts(1).await.unwrap(), vec![(htlc, 10)]);
    }
}
