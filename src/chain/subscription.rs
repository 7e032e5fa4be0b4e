//! Polling event subscription over a growable set of contracts

use super::ChainGateway;
use crate::error::RelayerResult;
use crate::events::RawEvent;

use ethers::types::Address;
use futures::stream::{self, Stream};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Contracts whose logs are fetched; factories add HTLCs at runtime
#[derive(Default)]
pub struct WatchSet {
    addresses: RwLock<BTreeSet<Address>>,
}

impl WatchSet {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self {
            addresses: RwLock::new(addresses.into_iter().collect()),
        }
    }

    /// Returns `true` if the address was not watched yet
    pub async fn insert(&self, address: Address) -> bool {
        self.addresses.write().await.insert(address)
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.addresses.read().await.contains(address)
    }

    pub async fn snapshot(&self) -> Vec<Address> {
        self.addresses.read().await.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.addresses.read().await.len()
    }
}

/// Logs of one polling round
#[derive(Debug, Clone)]
pub struct ChainBatch {
    /// Chain head when the round started
    pub head: u64,
    pub from: u64,
    pub to: u64,
    pub events: Vec<RawEvent>,
}

/// Lazy, restartable log subscription for one chain.
///
/// Every round re-scans the last `depth` blocks below the cursor so that
/// transactions re-included after a reorg are delivered again.
pub struct EventSubscription {
    gateway: Arc<dyn ChainGateway>,
    watch: Arc<WatchSet>,
    depth: u64,
    poll_interval: Duration,
    max_block_range: u64,
    floor: u64,
    cursor: u64,
}

impl EventSubscription {
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        watch: Arc<WatchSet>,
        start_block: u64,
        depth: u64,
        poll_interval: Duration,
        max_block_range: u64,
    ) -> Self {
        Self {
            gateway,
            watch,
            depth,
            poll_interval,
            max_block_range: max_block_range.max(1),
            floor: start_block,
            cursor: start_block,
        }
    }

    /// Next block that has never been scanned
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Wait for new blocks and fetch their logs
    pub async fn next_batch(&mut self) -> RelayerResult<ChainBatch> {
        loop {
            let head = self.gateway.current_block_height().await?;
            crate::metrics::record_chain_head(self.gateway.chain_id(), head);

            if head < self.cursor {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            let from = self.cursor.saturating_sub(self.depth).max(self.floor);
            let to = head.min(self.cursor + self.max_block_range - 1);
            let addresses = self.watch.snapshot().await;
            let events = self.gateway.fetch_events(addresses, from, to).await?;

            debug!(
                "Chain {}: scanned blocks {} to {} (head {}), {} events",
                self.gateway.chain_id(),
                from,
                to,
                head,
                events.len()
            );

            self.cursor = to + 1;
            return Ok(ChainBatch {
                head,
                from,
                to,
                events,
            });
        }
    }

    /// Endless stream of batches; errors are yielded and the next poll retries
    pub fn into_stream(self) -> impl Stream<Item = RelayerResult<ChainBatch>> {
        stream::unfold(self, |mut subscription| async move {
            let batch = subscription.next_batch().await;
            Some((batch, subscription))
        })
    }
}
