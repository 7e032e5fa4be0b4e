//! Relay coordinator: the swap state machine shared by both chains

use crate::chain::ChainManager;
use crate::config::{RelayerConfig, TimeLockKind};
use crate::error::{RelayerError, RelayerResult};
use crate::events::DomainEvent;
use crate::hashlock::{short, ChainId, HashLock, Preimage};
use crate::ingestion::EventSink;
use crate::metrics;
use crate::state::{
    ActionKind, LockRecord, PreimageOutcome, Swap, SwapFlag, SwapRegistry, SwapStatus,
    UpsertOutcome,
};
use crate::tx::{Action, ActionExecutor, ActionOutcome, RetryPolicy};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Compare-and-swap retries when settling a swap from an observed event
const MAX_SETTLE_ATTEMPTS: usize = 3;

/// An action that has been scheduled and not finished yet
#[derive(Debug, Clone)]
struct InFlight {
    id: Uuid,
    kind: ActionKind,
    cancel: Arc<AtomicBool>,
}

/// What one sweep did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub relays: usize,
    pub refunds: usize,
    pub expired: usize,
}

/// Cross-chain relay coordinator
pub struct RelayCoordinator {
    /// Chain manager for both sides of the swap
    chains: Arc<ChainManager>,
    /// Swap registry, the source of truth for lifecycle state
    registry: Arc<dyn SwapRegistry>,
    /// Runs unlock/refund actions
    executor: Arc<ActionExecutor>,
    /// Configuration
    config: RelayerConfig,
    /// At most one action per hash lock
    in_flight: Arc<DashMap<HashLock, InFlight>>,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
    stop_signal: Notify,
}

impl RelayCoordinator {
    pub fn new(
        chains: Arc<ChainManager>,
        registry: Arc<dyn SwapRegistry>,
        config: RelayerConfig,
    ) -> Self {
        let executor = Arc::new(ActionExecutor::new(
            chains.clone(),
            registry.clone(),
            RetryPolicy::from_config(&config),
            config.confirmation_timeout(),
        ));

        Self {
            chains,
            registry,
            executor,
            config,
            in_flight: Arc::new(DashMap::new()),
            shutdown: Arc::new(RwLock::new(false)),
            stop_signal: Notify::new(),
        }
    }

    /// Main coordination loop: deadline sweep and archival.
    ///
    /// The first sweep runs immediately and doubles as restart recovery.
    pub async fn run(&self) -> RelayerResult<()> {
        let mut sweep_interval = interval(self.config.sweep_interval());
        let mut archive_interval = interval(Duration::from_secs(300)); // 5 minutes

        info!(
            "Relay coordinator {} started (shard {}/{})",
            self.config.instance_id, self.config.shard_index, self.config.shard_count
        );

        loop {
            if *self.shutdown.read().await {
                break;
            }

            tokio::select! {
                _ = sweep_interval.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            debug!("Sweep: {:?}", report);
                        }
                        Ok(_) => {}
                        Err(e) => error!("Error sweeping pending swaps: {}", e),
                    }
                }

                _ = archive_interval.tick() => {
                    if let Err(e) = self.archive().await {
                        error!("Error archiving terminal swaps: {}", e);
                    }
                }

                _ = self.stop_signal.notified() => {}
            }
        }

        info!("Relay coordinator stopped");
        Ok(())
    }

    /// Stop scheduling and wait (bounded) for outstanding actions.
    ///
    /// Broadcast transactions cannot be withdrawn, so nothing is cancelled here.
    pub async fn stop(&self, grace: Duration) {
        *self.shutdown.write().await = true;
        self.stop_signal.notify_waiters();
        info!("Relay coordinator shutdown initiated");

        if !self.wait_for_idle(grace).await {
            warn!(
                "{} actions still in flight after {:?}; the next start recovers them",
                self.in_flight.len(),
                grace
            );
        }
    }

    /// Wait until no action is in flight; `false` on timeout
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.in_flight.is_empty() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether this instance handles `hash_lock`
    pub fn owns(&self, hash_lock: &HashLock) -> bool {
        shard_of(hash_lock, self.config.shard_count) == self.config.shard_index
    }

    /// Operator re-arm of a flagged swap, followed by an immediate evaluation
    pub async fn retry(&self, hash_lock: HashLock) -> RelayerResult<Swap> {
        let swap = self.registry.clear_flag(hash_lock).await?;
        info!("Swap {} re-armed by operator", short(&hash_lock));

        let mut clock = DeadlineClock::new(&self.chains);
        let mut report = SweepReport::default();
        self.evaluate(&swap, &mut clock, &mut report).await?;

        Ok(self.registry.get(hash_lock).await?.unwrap_or(swap))
    }

    /// One pass over every pending swap
    pub async fn sweep_once(&self) -> RelayerResult<SweepReport> {
        let pending = self.registry.list_pending().await?;
        let mut clock = DeadlineClock::new(&self.chains);
        let mut report = SweepReport::default();

        for swap in pending.iter().filter(|s| self.owns(&s.hash_lock)) {
            report.scanned += 1;
            if let Err(e) = self.evaluate(swap, &mut clock, &mut report).await {
                warn!("Sweep of swap {} failed: {}", short(&swap.hash_lock), e);
            }
        }

        Ok(report)
    }

    pub async fn archive(&self) -> RelayerResult<u64> {
        let before = Utc::now() - chrono::Duration::seconds(self.config.archive_after_secs as i64);
        let archived = self.registry.archive_terminal(before).await?;
        if archived > 0 {
            info!("Archived {} terminal swaps", archived);
        }
        Ok(archived)
    }

    /// Decide what a pending swap needs right now
    async fn evaluate(
        &self,
        swap: &Swap,
        clock: &mut DeadlineClock<'_>,
        report: &mut SweepReport,
    ) -> RelayerResult<()> {
        if swap.flag.is_some() || swap.status.is_terminal() {
            return Ok(());
        }

        // relay wins over refund whenever it is possible at all
        if swap.can_relay() {
            if self.start_relay(swap).await? {
                report.relays += 1;
            }
            return Ok(());
        }

        match swap.status {
            SwapStatus::Locked => {
                if clock.expired(swap).await? != Some(true) {
                    return Ok(());
                }
                if swap.preimage.is_some() {
                    self.expire_unresolved(swap).await?;
                    report.expired += 1;
                } else if self.start_refund(swap).await? {
                    report.refunds += 1;
                }
            }
            SwapStatus::Refunding if swap.preimage.is_some() => {
                let message = "refund pending but preimage known and no counter HTLC".to_string();
                self.registry
                    .flag(swap.hash_lock, SwapFlag::Unresolvable, message.clone())
                    .await?;
                metrics::alert(SwapFlag::Unresolvable.as_str(), &swap.hash_lock, &message);
            }
            SwapStatus::Refunding => {
                if self.start_refund(swap).await? {
                    report.refunds += 1;
                }
            }
            _ => {}
        }

        Ok(())
    }

    async fn on_lock(&self, record: LockRecord) -> RelayerResult<()> {
        let chain = record.chain;
        let outcome = self.registry.upsert_on_lock(record).await?;

        match &outcome {
            UpsertOutcome::Created(swap) => {
                info!(
                    "Swap {} locked on chain {} (counter chain {})",
                    short(&swap.hash_lock),
                    chain,
                    swap.counter_chain
                );
                metrics::record_swap_created(chain);
            }
            UpsertOutcome::CounterLearned(swap) => {
                info!(
                    "Swap {}: counter HTLC {:?} found on chain {}",
                    short(&swap.hash_lock),
                    swap.counter_htlc,
                    chain
                );
            }
            UpsertOutcome::Unchanged(_) => return Ok(()),
        }

        // an unlock may have raced ahead of this lock
        let swap = outcome.swap();
        if swap.can_relay() && swap.flag.is_none() {
            self.start_relay(swap).await?;
        }
        Ok(())
    }

    async fn on_unlock(
        &self,
        chain: ChainId,
        hash_lock: HashLock,
        htlc: Address,
        preimage: Preimage,
    ) -> RelayerResult<()> {
        match self.registry.record_preimage(hash_lock, preimage).await {
            Ok(PreimageOutcome::Recorded) => {
                info!("Preimage for {} revealed on chain {}", short(&hash_lock), chain);
            }
            Ok(PreimageOutcome::AlreadyKnown) => {}
            Err(RelayerError::Conflict { .. }) => return self.freeze(hash_lock, chain).await,
            Err(e) => return Err(e),
        }

        let swap = match self.registry.get(hash_lock).await? {
            Some(swap) => swap,
            None => {
                debug!("Preimage for {} kept until a lock is seen", short(&hash_lock));
                return Ok(());
            }
        };

        if swap.is_frozen() {
            return Ok(());
        }

        if chain == swap.counter_chain {
            // the counter HTLC was opened by someone else; nothing left to relay
            debug!("Swap {} unlocked on counter HTLC {:?}", short(&hash_lock), htlc);
            self.cancel(&hash_lock);
            return self.settle(hash_lock, SwapStatus::Relayed).await;
        }

        if swap.counter_htlc.is_none() {
            info!(
                "Swap {}: preimage known, relay waits for the counter HTLC",
                short(&hash_lock)
            );
            return Ok(());
        }

        if swap.flag.is_none() {
            self.start_relay(&swap).await?;
        }
        Ok(())
    }

    async fn on_refund(&self, chain: ChainId, hash_lock: HashLock) -> RelayerResult<()> {
        self.cancel(&hash_lock);

        if let Some(swap) = self.registry.get(hash_lock).await? {
            if swap.preimage.is_some() && !swap.status.is_terminal() {
                metrics::alert(
                    "refunded_with_preimage",
                    &hash_lock,
                    &format!("HTLC on chain {} refunded although the preimage is known", chain),
                );
            }
        }

        self.settle(hash_lock, SwapStatus::Refunded).await
    }

    /// Two preimages for one hash lock: freeze and alert
    async fn freeze(&self, hash_lock: HashLock, chain: ChainId) -> RelayerResult<()> {
        self.cancel(&hash_lock);
        let message = format!("different preimage revealed on chain {}", chain);

        if self.registry.get(hash_lock).await?.is_some() {
            self.registry
                .flag(hash_lock, SwapFlag::PreimageConflict, message.clone())
                .await?;
        }
        metrics::alert(SwapFlag::PreimageConflict.as_str(), &hash_lock, &message);
        Ok(())
    }

    /// Record an outcome observed on chain, whatever the swap's current status
    async fn settle(&self, hash_lock: HashLock, to: SwapStatus) -> RelayerResult<()> {
        for _ in 0..MAX_SETTLE_ATTEMPTS {
            let swap = match self.registry.get(hash_lock).await? {
                Some(swap) => swap,
                None => {
                    warn!("{} observed for unknown swap {}", to, short(&hash_lock));
                    return Ok(());
                }
            };

            if swap.status.is_terminal() {
                if swap.status != to {
                    warn!(
                        "Swap {} is already {}; ignoring on-chain {}",
                        short(&hash_lock),
                        swap.status,
                        to
                    );
                }
                return Ok(());
            }

            match self.registry.transition(hash_lock, swap.status, to).await {
                Ok(_) => {
                    info!("Swap {} {}", short(&hash_lock), to);
                    return Ok(());
                }
                Err(e) if e.is_stale() => continue,
                Err(e) => return Err(e),
            }
        }

        Err(RelayerError::Internal(format!(
            "swap {} kept changing while recording {}",
            short(&hash_lock),
            to
        )))
    }

    /// Move to RELAYING (if needed) and schedule the counter-chain unlock
    async fn start_relay(&self, swap: &Swap) -> RelayerResult<bool> {
        if !swap.can_relay() || swap.is_frozen() || self.is_shutting_down().await {
            return Ok(false);
        }

        match swap.status {
            SwapStatus::Locked | SwapStatus::Refunding => {
                match self
                    .registry
                    .transition(swap.hash_lock, swap.status, SwapStatus::Relaying)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_stale() => return Ok(false),
                    Err(RelayerError::SwapFrozen { .. }) => return Ok(false),
                    Err(e) => return Err(e),
                }
                info!(
                    "Relaying preimage of {} to chain {}",
                    short(&swap.hash_lock),
                    swap.counter_chain
                );
            }
            SwapStatus::Relaying => {}
            _ => return Ok(false),
        }

        Ok(self.schedule(swap.hash_lock, ActionKind::Unlock))
    }

    /// Move to REFUNDING (if needed) and schedule the origin-chain refund
    async fn start_refund(&self, swap: &Swap) -> RelayerResult<bool> {
        if swap.preimage.is_some() || self.is_shutting_down().await {
            return Ok(false);
        }

        match swap.status {
            SwapStatus::Locked => {
                match self
                    .registry
                    .transition(swap.hash_lock, SwapStatus::Locked, SwapStatus::Refunding)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_stale() => return Ok(false),
                    // preimage arrived in between; the next evaluation relays
                    Err(RelayerError::RefundPreempted { .. }) => return Ok(false),
                    Err(RelayerError::SwapFrozen { .. }) => return Ok(false),
                    Err(e) => return Err(e),
                }
                info!(
                    "Swap {} expired unrevealed; refunding on chain {}",
                    short(&swap.hash_lock),
                    swap.origin_chain
                );
            }
            SwapStatus::Refunding => {}
            _ => return Ok(false),
        }

        Ok(self.schedule(swap.hash_lock, ActionKind::Refund))
    }

    async fn expire_unresolved(&self, swap: &Swap) -> RelayerResult<()> {
        match self
            .registry
            .transition(swap.hash_lock, SwapStatus::Locked, SwapStatus::ExpiredUnresolved)
            .await
        {
            Ok(_) => {
                metrics::alert(
                    "expired_unresolved",
                    &swap.hash_lock,
                    "deadline passed with a preimage but no counter HTLC to relay to",
                );
                Ok(())
            }
            Err(e) if e.is_stale() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Spawn an action unless the same kind is already in flight.
    ///
    /// A different kind replaces (and cancels) the earlier action.
    fn schedule(&self, hash_lock: HashLock, kind: ActionKind) -> bool {
        let action = Action::new(hash_lock, kind);
        let entry = InFlight {
            id: action.id,
            kind,
            cancel: action.cancel.clone(),
        };

        match self.in_flight.entry(hash_lock) {
            Entry::Occupied(existing) if existing.get().kind == kind => {
                debug!("{} for {} already in flight", kind.as_str(), short(&hash_lock));
                return false;
            }
            Entry::Occupied(mut existing) => {
                existing.get().cancel.store(true, Ordering::SeqCst);
                existing.insert(entry);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }

        let executor = self.executor.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            match executor.execute(&action).await {
                Ok(ActionOutcome::Completed(status)) | Ok(ActionOutcome::Reconciled(status)) => {
                    info!("Swap {} {}", short(&action.hash_lock), status);
                }
                Ok(ActionOutcome::Skipped(reason)) => {
                    debug!(
                        "{} for {} skipped: {}",
                        action.kind.as_str(),
                        short(&action.hash_lock),
                        reason
                    );
                }
                Ok(ActionOutcome::Cancelled) => {
                    debug!("{} for {} cancelled", action.kind.as_str(), short(&action.hash_lock));
                }
                Ok(ActionOutcome::Flagged(flag)) => {
                    warn!("Swap {} flagged {}", short(&action.hash_lock), flag.as_str());
                }
                Err(e) => {
                    error!(
                        "{} for {} failed: {}",
                        action.kind.as_str(),
                        short(&action.hash_lock),
                        e
                    );
                    if e.should_alert() {
                        metrics::alert("action_error", &action.hash_lock, &e.to_string());
                    }
                }
            }
            in_flight.remove_if(&action.hash_lock, |_, current| current.id == action.id);
        });

        true
    }

    /// Mark the in-flight action for `hash_lock` cancelled, if any
    fn cancel(&self, hash_lock: &HashLock) {
        if let Some(current) = self.in_flight.get(hash_lock) {
            current.cancel.store(true, Ordering::SeqCst);
        }
    }

    async fn is_shutting_down(&self) -> bool {
        *self.shutdown.read().await
    }
}

#[async_trait]
impl EventSink for RelayCoordinator {
    async fn handle_event(&self, event: DomainEvent) -> RelayerResult<()> {
        if let Some(hash_lock) = event.hash_lock() {
            if !self.owns(&hash_lock) {
                return Ok(());
            }
        }

        debug!("Handling event: {}", event.name());

        match event {
            DomainEvent::LockObserved(record) => self.on_lock(record).await,
            DomainEvent::UnlockObserved {
                chain,
                hash_lock,
                htlc,
                preimage,
            } => self.on_unlock(chain, hash_lock, htlc, preimage).await,
            DomainEvent::RefundObserved {
                chain, hash_lock, ..
            } => self.on_refund(chain, hash_lock).await,
            DomainEvent::FactoryDeployed { chain, htlc } => {
                debug!("HTLC {:?} deployed on chain {}", htlc, chain);
                Ok(())
            }
        }
    }
}

/// Shard of a hash lock: its first 8 bytes modulo the shard count
pub fn shard_of(hash_lock: &HashLock, shard_count: u64) -> u64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash_lock.as_bytes()[..8]);
    u64::from_be_bytes(prefix) % shard_count.max(1)
}

/// Current time per origin chain, fetched at most once per sweep.
///
/// Block and timestamp locks are both read from the chain's latest block,
/// the same clock the HTLC contract checks a refund against.
struct DeadlineClock<'a> {
    chains: &'a ChainManager,
    readings: HashMap<ChainId, Option<u64>>,
}

impl<'a> DeadlineClock<'a> {
    fn new(chains: &'a ChainManager) -> Self {
        Self {
            chains,
            readings: HashMap::new(),
        }
    }

    /// `None` when the origin chain's clock is unavailable
    async fn expired(&mut self, swap: &Swap) -> RelayerResult<Option<bool>> {
        let chain_id = swap.origin_chain;
        let kind = self.chains.params(chain_id)?.time_lock_kind;

        if !self.readings.contains_key(&chain_id) {
            let gateway = self.chains.gateway(chain_id)?;
            let reading = match kind {
                TimeLockKind::Timestamp => gateway.latest_block_timestamp().await,
                TimeLockKind::Block => gateway.current_block_height().await,
            };
            let reading = match reading {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Clock of chain {} unavailable for deadlines: {}", chain_id, e);
                    None
                }
            };
            self.readings.insert(chain_id, reading);
        }

        let current = self.readings.get(&chain_id).copied().flatten();
        Ok(current.map(|now| now >= swap.time_lock))
    }
}
