//! Chain finality handling for observed events
//!
//! Events are held until they are `confirmation_blocks` deep. Before release,
//! each event's block hash is compared with the canonical hash at that
//! height; events from blocks that were reorganised away are dropped.

use super::ChainGateway;
use crate::error::RelayerResult;
use crate::events::RawEvent;
use crate::hashlock::ChainId;
use crate::state::EventKey;

use ethers::types::H256;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Observed events waiting for confirmation depth on one chain
pub struct ConfirmationBuffer {
    chain_id: ChainId,
    depth: u64,
    pending: HashMap<EventKey, RawEvent>,
}

impl ConfirmationBuffer {
    pub fn new(chain_id: ChainId, depth: u64) -> Self {
        Self {
            chain_id,
            depth,
            pending: HashMap::new(),
        }
    }

    /// Track an event; a re-delivery of the same log replaces the earlier copy
    pub fn insert(&mut self, event: RawEvent) {
        if let Some(previous) = self.pending.insert(event.key(), event) {
            debug!(
                "Chain {}: log {:?} re-delivered (was block {})",
                self.chain_id, previous.tx_hash, previous.block_number
            );
        }
    }

    /// Put back events that were released but not handled
    pub fn restore(&mut self, events: impl IntoIterator<Item = RawEvent>) {
        for event in events {
            self.pending.entry(event.key()).or_insert(event);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn is_final(&self, block_number: u64, head: u64) -> bool {
        head >= block_number && head - block_number >= self.depth
    }

    /// Release every event that is final at `head`, ordered by (block, log index).
    ///
    /// On an RPC error nothing is released and the buffer is unchanged.
    pub async fn drain_final(
        &mut self,
        head: u64,
        gateway: &dyn ChainGateway,
    ) -> RelayerResult<Vec<RawEvent>> {
        let mut final_keys: Vec<(u64, u64, EventKey)> = self
            .pending
            .values()
            .filter(|e| self.is_final(e.block_number, head))
            .map(|e| (e.block_number, e.log_index, e.key()))
            .collect();
        final_keys.sort();

        let mut canonical: HashMap<u64, Option<H256>> = HashMap::new();
        for (block, _, _) in &final_keys {
            if !canonical.contains_key(block) {
                canonical.insert(*block, gateway.block_hash(*block).await?);
            }
        }

        let mut released = Vec::with_capacity(final_keys.len());
        for (block, _, key) in final_keys {
            let Some(event) = self.pending.remove(&key) else {
                continue;
            };

            if canonical.get(&block).copied().flatten() == Some(event.block_hash) {
                released.push(event);
            } else {
                warn!(
                    "Chain {}: dropping orphaned {} event in tx {:?} (block {} {:?})",
                    self.chain_id,
                    event.name(),
                    event.tx_hash,
                    event.block_number,
                    event.block_hash
                );
                crate::metrics::record_orphaned(self.chain_id);
            }
        }

        Ok(released)
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: ChainId) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Manta Pacific mainnet / Sepolia
        169 | 3441006 => 12,
        // Morph mainnet / Holesky
        2818 | 2810 => 12,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Default conservative
        _ => 64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{raw_event, FakeGateway};

    #[tokio::test]
    async fn test_holds_until_depth() {
        let gateway = FakeGateway::new(1);
        let mut buffer = ConfirmationBuffer::new(1, 3);
        let event = raw_event(1, 10, 0, gateway.canonical_hash(10));
        buffer.insert(event.clone());

        assert!(buffer.drain_final(12, &gateway).await.unwrap().is_empty());
        assert_eq!(buffer.len(), 1);

        let released = buffer.drain_final(13, &gateway).await.unwrap();
        assert_eq!(released, vec![event]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_event_is_dropped() {
        let gateway = FakeGateway::new(1);
        let mut buffer = ConfirmationBuffer::new(1, 2);
        buffer.insert(raw_event(1, 5, 0, H256::repeat_byte(0xde)));

        assert!(buffer.drain_final(20, &gateway).await.unwrap().is_empty());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_after_reorg_replaces_copy() {
        let gateway = FakeGateway::new(1);
        let mut buffer = ConfirmationBuffer::new(1, 2);

        // first seen in a block that is later reorganised away
        let mut stale = raw_event(1, 5, 0, H256::repeat_byte(0xde));
        stale.tx_hash = H256::repeat_byte(7);
        buffer.insert(stale.clone());

        // the same transaction re-included one block later
        let mut reincluded = raw_event(1, 6, 0, gateway.canonical_hash(6));
        reincluded.tx_hash = stale.tx_hash;
        buffer.insert(reincluded.clone());

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.drain_final(8, &gateway).await.unwrap(), vec![reincluded]);
    }

    #[tokio::test]
    async fn test_release_order() {
        let gateway = FakeGateway::new(1);
        let mut buffer = ConfirmationBuffer::new(1, 1);
        for (block, index) in [(4, 1), (3, 5), (4, 0)] {
            let mut event = raw_event(1, block, index, gateway.canonical_hash(block));
            event.tx_hash = H256::from_low_u64_be(block * 10 + index);
            buffer.insert(event);
        }

        let released = buffer.drain_final(10, &gateway).await.unwrap();
        let order: Vec<(u64, u64)> = released
            .iter()
            .map(|e| (e.block_number, e.log_index))
            .collect();
        assert_eq!(order, vec![(3, 5), (4, 0), (4, 1)]);
    }

    #[test]
    fn test_recommended_confirmations() {
        assert_eq!(recommended_confirmations(1), 32);
        assert_eq!(recommended_confirmations(3441006), 12);
        assert_eq!(recommended_confirmations(2810), 12);
        assert_eq!(recommended_confirmations(999_999), 64);
    }
}
