//! Event ingestion pipeline
//!
//! One pipeline per chain turns the gateway's log stream into final,
//! deduplicated [`DomainEvent`]s:
//! 1. Poll batches of logs over the watched contracts
//! 2. Hold them in a [`ConfirmationBuffer`] until they are deep enough
//! 3. Drop the ones whose block was reorganised away
//! 4. Translate, hand to the [`EventSink`], mark processed, checkpoint

use crate::chain::{
    ChainBatch, ChainGateway, ChainParams, ConfirmationBuffer, EventSubscription, WatchSet,
};
use crate::error::{RelayerError, RelayerResult};
use crate::events::{DomainEvent, RawEvent, RawEventKind};
use crate::hashlock::{short, ChainId, HashFunction};
use crate::metrics;
use crate::state::{CheckpointStore, LockRecord, SwapRegistry};

use async_trait::async_trait;
use ethers::types::Address;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consumer of final domain events.
///
/// An event counts as processed once `handle_event` returns `Ok`.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle_event(&self, event: DomainEvent) -> RelayerResult<()>;
}

pub struct EventPipeline {
    params: ChainParams,
    counter_chain: ChainId,
    gateway: Arc<dyn ChainGateway>,
    registry: Arc<dyn SwapRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn EventSink>,
    hash_function: HashFunction,
    /// Shard whose checkpoint and processed keys this pipeline owns
    shard: u64,
    watch: Arc<WatchSet>,
    buffer: ConfirmationBuffer,
    /// Deployed HTLCs whose history still has to be fetched
    backfills: VecDeque<(Address, u64)>,
    checkpoint: Option<u64>,
}

impl EventPipeline {
    pub fn new(
        params: ChainParams,
        counter_chain: ChainId,
        gateway: Arc<dyn ChainGateway>,
        registry: Arc<dyn SwapRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        sink: Arc<dyn EventSink>,
        hash_function: HashFunction,
    ) -> Self {
        let watch = Arc::new(WatchSet::new(
            params.factories.iter().chain(params.htlcs.iter()).copied(),
        ));
        let buffer = ConfirmationBuffer::new(params.chain_id, params.confirmation_depth);

        Self {
            params,
            counter_chain,
            gateway,
            registry,
            checkpoints,
            sink,
            hash_function,
            shard: 0,
            watch,
            buffer,
            backfills: VecDeque::new(),
            checkpoint: None,
        }
    }

    pub fn with_shard(mut self, shard: u64) -> Self {
        self.shard = shard;
        self
    }

    pub fn chain_id(&self) -> ChainId {
        self.params.chain_id
    }

    pub fn watch_set(&self) -> Arc<WatchSet> {
        self.watch.clone()
    }

    /// Restore the checkpoint and watched contracts, and open the subscription
    pub async fn resume(&mut self) -> RelayerResult<EventSubscription> {
        let chain_id = self.chain_id();

        self.checkpoint = self.checkpoints.get_checkpoint(self.shard, chain_id).await?;
        let start_block = self
            .checkpoint
            .map(|block| block + 1)
            .unwrap_or(self.params.start_block);

        for (address, _) in self.checkpoints.watched_contracts(chain_id).await? {
            self.watch.insert(address).await;
        }

        info!(
            "Chain {}: resuming ingestion at block {} with {} watched contracts",
            chain_id,
            start_block,
            self.watch.len().await
        );

        Ok(EventSubscription::new(
            self.gateway.clone(),
            self.watch.clone(),
            start_block,
            self.params.confirmation_depth,
            self.params.poll_interval,
            self.params.max_block_range,
        ))
    }

    /// Main ingestion loop
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RelayerResult<()> {
        let subscription = self.resume().await?;
        let mut batches = Box::pin(subscription.into_stream());

        info!("Event pipeline for chain {} started", self.chain_id());

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }

                batch = batches.next() => match batch {
                    Some(Ok(batch)) => {
                        if let Err(e) = self.process_batch(batch).await {
                            error!("Chain {}: batch processing failed: {}", self.chain_id(), e);
                            tokio::time::sleep(self.params.poll_interval).await;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Chain {}: polling failed: {}", self.chain_id(), e);
                        tokio::time::sleep(self.params.poll_interval).await;
                    }
                    None => break,
                },
            }
        }

        info!("Event pipeline for chain {} stopped", self.chain_id());
        Ok(())
    }

    /// Buffer a batch, emit what became final, and advance the checkpoint
    pub async fn process_batch(&mut self, batch: ChainBatch) -> RelayerResult<()> {
        let chain_id = self.chain_id();

        for event in batch.events {
            if let RawEventKind::HtlcDeployed { htlc } = event.kind {
                self.backfills.push_back((htlc, event.block_number));
            }
            self.buffer.insert(event);
        }

        // kept until the fetch succeeds; the cursor has already moved past these blocks
        while let Some(&(htlc, from)) = self.backfills.front() {
            self.backfill(htlc, from, batch.to).await?;
            self.backfills.pop_front();
        }

        let released = self
            .buffer
            .drain_final(batch.head, self.gateway.as_ref())
            .await?;

        let mut released = released.into_iter();
        while let Some(event) = released.next() {
            if let Err(e) = self.process_event(&event).await {
                // hand the rest back; they are retried on the next batch
                self.buffer.restore(std::iter::once(event).chain(released));
                return Err(e);
            }
        }

        let checkpoint = batch
            .to
            .min(batch.head.saturating_sub(self.params.confirmation_depth));
        if self.checkpoint.map_or(true, |current| checkpoint > current) {
            self.checkpoints
                .save_checkpoint(self.shard, chain_id, checkpoint)
                .await?;
            self.checkpoint = Some(checkpoint);
            metrics::record_checkpoint(chain_id, checkpoint);
        }

        debug!(
            "Chain {}: blocks {}..={} done, {} events buffered",
            chain_id,
            batch.from,
            batch.to,
            self.buffer.len()
        );
        Ok(())
    }

    /// Watch a freshly deployed HTLC and pull its logs since deployment
    async fn backfill(&mut self, htlc: Address, from: u64, to: u64) -> RelayerResult<()> {
        if self.watch.contains(&htlc).await {
            return Ok(());
        }

        let events = self.gateway.fetch_events(vec![htlc], from, to).await?;
        for event in events {
            self.buffer.insert(event);
        }
        self.watch.insert(htlc).await;
        info!("Chain {}: watching new HTLC {:?}", self.chain_id(), htlc);
        Ok(())
    }

    async fn process_event(&self, event: &RawEvent) -> RelayerResult<()> {
        let key = event.key();
        if self.checkpoints.is_processed(self.shard, &key).await? {
            debug!("Chain {}: skipping processed log {:?}", self.chain_id(), event.tx_hash);
            return Ok(());
        }

        match self.translate(event).await {
            Ok(Some(domain_event)) => {
                debug!(
                    "Chain {}: {} at block {}",
                    self.chain_id(),
                    domain_event.name(),
                    event.block_number
                );
                self.sink.handle_event(domain_event).await?;
            }
            Ok(None) => {}
            Err(RelayerError::EventParsing(reason)) => {
                error!(
                    "Chain {}: rejected {} log in tx {:?}: {}",
                    self.chain_id(),
                    event.name(),
                    event.tx_hash,
                    reason
                );
            }
            Err(e) => return Err(e),
        }

        self.checkpoints.mark_processed(self.shard, &key).await?;
        metrics::record_event(self.chain_id(), event.name());
        Ok(())
    }

    /// Map a final log to the event the coordinator understands
    async fn translate(&self, event: &RawEvent) -> RelayerResult<Option<DomainEvent>> {
        let chain = self.chain_id();

        match &event.kind {
            RawEventKind::Locked {
                sender,
                amount,
                hash_lock,
                time_lock,
            } => {
                let receiver = match self.gateway.htlc_info(event.address).await {
                    Ok(info) => info.receiver,
                    Err(e) => {
                        debug!("Receiver of {:?} unavailable: {}", event.address, e);
                        None
                    }
                };

                Ok(Some(DomainEvent::LockObserved(LockRecord {
                    hash_lock: *hash_lock,
                    chain,
                    counter_chain: self.counter_chain,
                    htlc: event.address,
                    amount: *amount,
                    sender: *sender,
                    receiver,
                    time_lock: *time_lock,
                })))
            }

            RawEventKind::Unlocked { preimage, .. } => {
                let hash_lock = self.hash_function.hash(preimage);

                if let Some(indexed) = self.registry.find_by_htlc(chain, event.address).await? {
                    if !self.hash_function.verify(&indexed, preimage) {
                        return Err(RelayerError::EventParsing(format!(
                            "preimage hashes to {} but HTLC {:?} escrows {}",
                            short(&hash_lock),
                            event.address,
                            short(&indexed)
                        )));
                    }
                }

                Ok(Some(DomainEvent::UnlockObserved {
                    chain,
                    hash_lock,
                    htlc: event.address,
                    preimage: *preimage,
                }))
            }

            RawEventKind::Refunded { .. } => {
                match self.registry.find_by_htlc(chain, event.address).await? {
                    Some(hash_lock) => Ok(Some(DomainEvent::RefundObserved {
                        chain,
                        hash_lock,
                        htlc: event.address,
                    })),
                    None => {
                        warn!(
                            "Chain {}: refund on unknown HTLC {:?}, ignoring",
                            chain, event.address
                        );
                        Ok(None)
                    }
                }
            }

            RawEventKind::HtlcDeployed { htlc } => {
                self.checkpoints
                    .watch_contract(chain, *htlc, event.block_number)
                    .await?;
                self.watch.insert(*htlc).await;
                Ok(Some(DomainEvent::FactoryDeployed { chain, htlc: *htlc }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{chain_params, FakeGateway};
    use crate::chain::ChainManager;
    use crate::config::RelayerConfig;
    use crate::coordination::{shard_of, RelayCoordinator};
    use crate::state::swap::tests::lock_record;
    use crate::state::{EventKey, MemoryStore};
    use ethers::types::H256;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DomainEvent>>,
        failures: AtomicU32,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<DomainEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn handle_event(&self, event: DomainEvent) -> RelayerResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(RelayerError::Internal("sink unavailable".into()));
            }
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Harness {
        gateway: Arc<FakeGateway>,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                gateway: Arc::new(FakeGateway::new(1)),
                store: Arc::new(MemoryStore::new()),
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn pipeline(&self, factories: Vec<Address>, htlcs: Vec<Address>) -> EventPipeline {
            let mut params = chain_params(1);
            params.start_block = 90;
            params.factories = factories;
            params.htlcs = htlcs;
            EventPipeline::new(
                params,
                2,
                self.gateway.clone(),
                self.store.clone(),
                self.store.clone(),
                self.sink.clone(),
                HashFunction::Sha256,
            )
        }
    }

    async fn poll(
        pipeline: &mut EventPipeline,
        subscription: &mut EventSubscription,
    ) -> RelayerResult<()> {
        let batch = subscription.next_batch().await?;
        pipeline.process_batch(batch).await
    }

    #[tokio::test]
    async fn test_lock_released_only_at_depth() {
        let h = Harness::new();
        let htlc = Address::repeat_byte(0x11);
        h.gateway.emit_lock(htlc, H256::repeat_byte(1), 500, 99);

        let mut pipeline = h.pipeline(vec![], vec![htlc]);
        let mut subscription = pipeline.resume().await.unwrap();

        poll(&mut pipeline, &mut subscription).await.unwrap();
        assert!(h.sink.events().is_empty());
        assert_eq!(h.store.get_checkpoint(0, 1).await.unwrap(), Some(98));

        h.gateway.advance(1);
        poll(&mut pipeline, &mut subscription).await.unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DomainEvent::LockObserved(record) => {
                assert_eq!(record.hash_lock, H256::repeat_byte(1));
                assert_eq!(record.counter_chain, 2);
                assert_eq!(record.receiver, Some(Address::repeat_byte(0xbb)));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.store.get_checkpoint(0, 1).await.unwrap(), Some(99));
    }

    #[tokio::test]
    async fn test_replay_after_restart_is_deduplicated() {
        let h = Harness::new();
        let htlc = Address::repeat_byte(0x12);
        h.gateway.emit_lock(htlc, H256::repeat_byte(2), 500, 95);

        let mut pipeline = h.pipeline(vec![], vec![htlc]);
        let mut subscription = pipeline.resume().await.unwrap();
        poll(&mut pipeline, &mut subscription).await.unwrap();
        assert_eq!(h.sink.events().len(), 1);

        // a checkpoint behind the processed log forces a re-scan
        h.store.save_checkpoint(0, 1, 90).await.unwrap();
        let mut restarted = h.pipeline(vec![], vec![htlc]);
        let mut subscription = restarted.resume().await.unwrap();
        assert_eq!(subscription.cursor(), 91);
        poll(&mut restarted, &mut subscription).await.unwrap();

        assert_eq!(h.sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_orphaned_lock_never_reaches_sink() {
        let h = Harness::new();
        let htlc = Address::repeat_byte(0x13);
        let orphaned = h.gateway.emit_lock(htlc, H256::repeat_byte(3), 500, 99);

        let mut pipeline = h.pipeline(vec![], vec![htlc]);
        let mut subscription = pipeline.resume().await.unwrap();
        poll(&mut pipeline, &mut subscription).await.unwrap();

        // block 99 is replaced; the lock is re-included one block later
        h.gateway.reorg(99);
        let reincluded = h.gateway.emit_lock(htlc, H256::repeat_byte(3), 500, 100);
        h.gateway.advance(2);
        poll(&mut pipeline, &mut subscription).await.unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert!(!h.store.is_processed(0, &orphaned.key()).await.unwrap());
        assert!(h.store.is_processed(0, &reincluded.key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_sink_failure_holds_checkpoint_and_retries() {
        let h = Harness::new();
        let htlc = Address::repeat_byte(0x14);
        h.gateway.emit_lock(htlc, H256::repeat_byte(4), 500, 92);
        h.gateway.emit_lock(htlc, H256::repeat_byte(5), 500, 93);
        h.sink.failures.store(1, Ordering::SeqCst);

        let mut pipeline = h.pipeline(vec![], vec![htlc]);
        let mut subscription = pipeline.resume().await.unwrap();

        assert!(poll(&mut pipeline, &mut subscription).await.is_err());
        assert!(h.sink.events().is_empty());
        assert_eq!(h.store.get_checkpoint(0, 1).await.unwrap(), None);

        h.gateway.advance(1);
        poll(&mut pipeline, &mut subscription).await.unwrap();

        let hashes: Vec<_> = h.sink.events().iter().filter_map(|e| e.hash_lock()).collect();
        assert_eq!(hashes, vec![H256::repeat_byte(4), H256::repeat_byte(5)]);
        assert_eq!(h.store.get_checkpoint(0, 1).await.unwrap(), Some(99));
    }

    #[tokio::test]
    async fn test_factory_deployment_extends_watch_set() {
        let h = Harness::new();
        let factory = Address::repeat_byte(0xfa);
        let htlc = Address::repeat_byte(0x15);
        h.gateway.emit_deployed(factory, htlc, 95);
        h.gateway.emit_lock(htlc, H256::repeat_byte(6), 500, 96);

        let mut pipeline = h.pipeline(vec![factory], vec![]);
        let mut subscription = pipeline.resume().await.unwrap();
        poll(&mut pipeline, &mut subscription).await.unwrap();

        let names: Vec<_> = h.sink.events().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["factory_deployed", "lock_observed"]);
        assert!(pipeline.watch_set().contains(&htlc).await);
        assert_eq!(h.store.watched_contracts(1).await.unwrap(), vec![(htlc, 95)]);

        // a restarted pipeline watches the HTLC from the start
        let mut restarted = h.pipeline(vec![factory], vec![]);
        restarted.resume().await.unwrap();
        assert!(restarted.watch_set().contains(&htlc).await);
    }

    #[tokio::test]
    async fn test_unlock_and_refund_translation() {
        let h = Harness::new();
        let preimage = H256::repeat_byte(0x5e);
        let hash_lock = HashFunction::Sha256.hash(&preimage);

        // index: HTLC of chain 1 escrows `hash_lock`, a second HTLC escrows another hash
        h.store.upsert_on_lock(lock_record(hash_lock, 1, 2)).await.unwrap();
        let known = Address::from_low_u64_be(1);
        let mut other = lock_record(H256::repeat_byte(7), 1, 2);
        other.htlc = Address::repeat_byte(0x16);
        h.store.upsert_on_lock(other).await.unwrap();

        h.gateway.emit_unlock(known, preimage, 91);
        let mismatched = h.gateway.emit_unlock(Address::repeat_byte(0x16), preimage, 92);
        h.gateway.emit_refund(Address::repeat_byte(0x17), 93);

        let watched = vec![known, Address::repeat_byte(0x16), Address::repeat_byte(0x17)];
        let mut pipeline = h.pipeline(vec![], watched);
        let mut subscription = pipeline.resume().await.unwrap();
        poll(&mut pipeline, &mut subscription).await.unwrap();

        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DomainEvent::UnlockObserved {
                hash_lock: observed,
                preimage: p,
                chain,
                ..
            } => {
                assert_eq!(*observed, hash_lock);
                assert_eq!(*p, preimage);
                assert_eq!(*chain, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        // rejected and skipped logs do not block the checkpoint
        let key: EventKey = mismatched.key();
        assert!(h.store.is_processed(0, &key).await.unwrap());
        assert_eq!(h.store.get_checkpoint(0, 1).await.unwrap(), Some(98));
    }

    fn sharded_config(shard_index: u64, shard_count: u64) -> RelayerConfig {
        RelayerConfig {
            instance_id: format!("relayer-{}", shard_index),
            sweep_interval_secs: 15,
            max_retries: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 1,
            confirmation_timeout_secs: 1,
            health_check_interval_secs: 30,
            archive_after_secs: 3600,
            hash_function: HashFunction::Sha256,
            shard_index,
            shard_count,
        }
    }

    #[tokio::test]
    async fn test_shards_sharing_a_store_each_ingest_their_locks() {
        let gateway = Arc::new(FakeGateway::new(1));
        let chains = Arc::new(ChainManager::new());
        chains.register(chain_params(1), gateway.clone());
        chains.register(chain_params(2), Arc::new(FakeGateway::new(2)));
        let store = Arc::new(MemoryStore::new());

        let hash = H256::repeat_byte(0x01);
        assert_eq!(shard_of(&hash, 2), 1);
        let htlc = Address::repeat_byte(0x18);
        let lock = gateway.emit_lock(htlc, hash, 500, 95);

        // the shard that does not own the lock reads the log first
        for shard in 0..2 {
            let coordinator = Arc::new(RelayCoordinator::new(
                chains.clone(),
                store.clone(),
                sharded_config(shard, 2),
            ));
            let mut params = chain_params(1);
            params.start_block = 90;
            params.htlcs = vec![htlc];
            let mut pipeline = EventPipeline::new(
                params,
                2,
                gateway.clone(),
                store.clone(),
                store.clone(),
                coordinator,
                HashFunction::Sha256,
            )
            .with_shard(shard);

            let mut subscription = pipeline.resume().await.unwrap();
            poll(&mut pipeline, &mut subscription).await.unwrap();

            let created = store.get(hash).await.unwrap().is_some();
            assert_eq!(created, shard == 1, "after shard {}", shard);
        }

        let key = lock.key();
        for shard in 0..2 {
            assert!(store.is_processed(shard, &key).await.unwrap());
            assert_eq!(store.get_checkpoint(shard, 1).await.unwrap(), Some(98));
        }
    }
}
