//! Action executor: one unlock or refund per invocation, with bounded retries

use super::backoff::RetryPolicy;
use crate::chain::{ChainManager, HtlcCall, HtlcMethod, HtlcState};
use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{short, ChainId, HashLock};
use crate::metrics;
use crate::state::{ActionKind, Submission, Swap, SwapFlag, SwapRegistry, SwapStatus};

use ethers::types::Address;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A scheduled unlock or refund
#[derive(Debug, Clone)]
pub struct Action {
    pub id: Uuid,
    pub hash_lock: HashLock,
    pub kind: ActionKind,
    pub cancel: Arc<AtomicBool>,
    pub scheduled_at: Instant,
}

impl Action {
    pub fn new(hash_lock: HashLock, kind: ActionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            hash_lock,
            kind,
            cancel: Arc::new(AtomicBool::new(false)),
            scheduled_at: Instant::now(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// How an action ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Our transaction confirmed and the swap reached this status
    Completed(SwapStatus),
    /// The HTLC was already settled on chain; the swap was moved to match
    Reconciled(SwapStatus),
    /// Nothing was sent (status moved on, flagged, or settled elsewhere)
    Skipped(String),
    Cancelled,
    /// Given up; the swap carries this flag for an operator
    Flagged(SwapFlag),
}

pub struct ActionExecutor {
    chains: Arc<ChainManager>,
    registry: Arc<dyn SwapRegistry>,
    policy: RetryPolicy,
    confirmation_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        chains: Arc<ChainManager>,
        registry: Arc<dyn SwapRegistry>,
        policy: RetryPolicy,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            chains,
            registry,
            policy,
            confirmation_timeout,
        }
    }

    /// Run one action to completion
    pub async fn execute(&self, action: &Action) -> RelayerResult<ActionOutcome> {
        if action.is_cancelled() {
            return Ok(ActionOutcome::Cancelled);
        }

        let swap = match self.registry.get(action.hash_lock).await? {
            Some(swap) => swap,
            None => return Ok(ActionOutcome::Skipped("swap not found".to_string())),
        };

        if let Some(reason) = skip_reason(&swap, action.kind) {
            debug!(
                "Skipping {} for {}: {}",
                action.kind.as_str(),
                short(&action.hash_lock),
                reason
            );
            return Ok(ActionOutcome::Skipped(reason));
        }

        let (chain_id, htlc, method) = target(&swap, action.kind)?;
        let gateway = self.chains.gateway(chain_id)?;
        let confirmations = self.chains.params(chain_id)?.tx_confirmations;
        let call = HtlcCall {
            contract: htlc,
            method,
        };

        // Pre-flight: never spend gas on an HTLC that is already settled
        match gateway.htlc_info(htlc).await {
            Ok(info) if info.state != HtlcState::Open => {
                return self.reconcile(&swap, action.kind, info.state).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Pre-flight read of {:?} failed: {}", htlc, e),
        }

        // A broadcast from an earlier run may still be pending; pay for a second one only
        // once it has definitely not landed
        if let Some(previous) = self
            .registry
            .last_submission(action.hash_lock, action.kind)
            .await?
            .filter(|s| s.chain_id == chain_id)
        {
            match gateway
                .wait_for_confirmation(previous.tx_hash, confirmations, self.confirmation_timeout)
                .await
            {
                Ok(receipt) => {
                    info!(
                        "Earlier {} {:?} for {} confirmed in block {}",
                        action.kind.as_str(),
                        previous.tx_hash,
                        short(&action.hash_lock),
                        receipt.block_number
                    );
                    return self.complete(action, chain_id).await;
                }
                Err(e) => {
                    if let Ok(info) = gateway.htlc_info(htlc).await {
                        if info.state != HtlcState::Open {
                            return self.reconcile(&swap, action.kind, info.state).await;
                        }
                    }
                    warn!(
                        "Earlier {} {:?} for {} did not confirm, resubmitting: {}",
                        action.kind.as_str(),
                        previous.tx_hash,
                        short(&action.hash_lock),
                        e
                    );
                }
            }
        }

        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            if action.is_cancelled() {
                return Ok(ActionOutcome::Cancelled);
            }

            self.registry.record_attempt(action.hash_lock).await?;

            match gateway.submit_transaction(call).await {
                Ok(tx_hash) => {
                    self.registry
                        .record_submission(&Submission {
                            action_id: action.id,
                            hash_lock: action.hash_lock,
                            kind: action.kind,
                            chain_id,
                            tx_hash,
                        })
                        .await?;
                    metrics::record_action_submitted(chain_id, action.kind.as_str());

                    return match gateway
                        .wait_for_confirmation(tx_hash, confirmations, self.confirmation_timeout)
                        .await
                    {
                        Ok(receipt) => {
                            info!(
                                "{} for {} confirmed on chain {} in block {}",
                                action.kind.as_str(),
                                short(&action.hash_lock),
                                chain_id,
                                receipt.block_number
                            );
                            self.complete(action, chain_id).await
                        }
                        Err(e @ RelayerError::ContractRevert { .. }) => {
                            warn!("{} for {} reverted: {}", action.kind.as_str(), short(&action.hash_lock), e);
                            self.reconcile_after_revert(&swap, action.kind, htlc, chain_id, e)
                                .await
                        }
                        Err(e) => {
                            self.give_up(action, chain_id, SwapFlag::ConfirmationTimeout, e)
                                .await
                        }
                    };
                }
                Err(e @ RelayerError::ContractRevert { .. }) => {
                    warn!(
                        "{} for {} rejected before broadcast: {}",
                        action.kind.as_str(),
                        short(&action.hash_lock),
                        e
                    );
                    return self
                        .reconcile_after_revert(&swap, action.kind, htlc, chain_id, e)
                        .await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        "Attempt {}/{} of {} for {} failed: {}",
                        attempt,
                        self.policy.max_attempts,
                        action.kind.as_str(),
                        short(&action.hash_lock),
                        e
                    );
                    last_error = Some(e);
                    if self.policy.has_attempts_left(attempt) {
                        tokio::time::sleep(self.policy.delay(attempt)).await;
                    }
                }
                Err(e) => {
                    return self
                        .give_up(action, chain_id, SwapFlag::RetriesExhausted, e)
                        .await;
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            RelayerError::Internal("no submission attempt was made".to_string())
        });
        self.give_up(action, chain_id, SwapFlag::RetriesExhausted, error)
            .await
    }

    async fn complete(&self, action: &Action, chain_id: ChainId) -> RelayerResult<ActionOutcome> {
        let terminal = action.kind.terminal_status();
        match self
            .registry
            .transition(action.hash_lock, action.kind.pending_status(), terminal)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_stale() => {
                debug!("Swap {} already advanced: {}", short(&action.hash_lock), e);
            }
            Err(e) => return Err(e),
        }

        metrics::record_action_completed(
            chain_id,
            action.kind.as_str(),
            action.scheduled_at.elapsed().as_secs_f64(),
        );
        Ok(ActionOutcome::Completed(terminal))
    }

    /// A revert usually means someone else settled the HTLC first
    async fn reconcile_after_revert(
        &self,
        swap: &Swap,
        kind: ActionKind,
        htlc: Address,
        chain_id: ChainId,
        error: RelayerError,
    ) -> RelayerResult<ActionOutcome> {
        let gateway = self.chains.gateway(chain_id)?;
        let state = gateway.htlc_info(htlc).await?.state;

        if state != HtlcState::Open {
            return self.reconcile(swap, kind, state).await;
        }

        let message = format!("{} reverted with HTLC still open: {}", kind.as_str(), error);
        self.registry
            .flag(swap.hash_lock, SwapFlag::ContractReverted, message.clone())
            .await?;
        metrics::record_action_failed(chain_id, kind.as_str());
        metrics::alert(SwapFlag::ContractReverted.as_str(), &swap.hash_lock, &message);
        Ok(ActionOutcome::Flagged(SwapFlag::ContractReverted))
    }

    /// Move the swap to the status matching a settled HTLC
    async fn reconcile(
        &self,
        swap: &Swap,
        kind: ActionKind,
        state: HtlcState,
    ) -> RelayerResult<ActionOutcome> {
        let to = match (kind, state) {
            (ActionKind::Unlock, HtlcState::Unlocked) => SwapStatus::Relayed,
            (ActionKind::Refund, HtlcState::Refunded) => SwapStatus::Refunded,
            (ActionKind::Unlock, HtlcState::Refunded) => {
                metrics::alert(
                    "counter_refunded",
                    &swap.hash_lock,
                    "counter HTLC was refunded before the preimage was relayed",
                );
                SwapStatus::Refunded
            }
            // The origin HTLC was unlocked; its Unlocked event carries the preimage
            (ActionKind::Refund, HtlcState::Unlocked) => {
                return Ok(ActionOutcome::Skipped(
                    "origin HTLC already unlocked".to_string(),
                ));
            }
            (_, HtlcState::Open) => {
                return Ok(ActionOutcome::Skipped("HTLC still open".to_string()));
            }
        };

        match self
            .registry
            .transition(swap.hash_lock, kind.pending_status(), to)
            .await
        {
            Ok(_) => {
                info!(
                    "Swap {} reconciled to {} from on-chain state",
                    short(&swap.hash_lock),
                    to
                );
                Ok(ActionOutcome::Reconciled(to))
            }
            Err(e) if e.is_stale() => Ok(ActionOutcome::Skipped(e.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn give_up(
        &self,
        action: &Action,
        chain_id: ChainId,
        flag: SwapFlag,
        error: RelayerError,
    ) -> RelayerResult<ActionOutcome> {
        let message = format!("{} on chain {}: {}", action.kind.as_str(), chain_id, error);
        self.registry
            .flag(action.hash_lock, flag, message.clone())
            .await?;
        metrics::record_action_failed(chain_id, action.kind.as_str());
        metrics::alert(flag.as_str(), &action.hash_lock, &message);
        Ok(ActionOutcome::Flagged(flag))
    }
}

fn skip_reason(swap: &Swap, kind: ActionKind) -> Option<String> {
    if swap.status != kind.pending_status() {
        return Some(format!("status is {}", swap.status));
    }
    if let Some(flag) = swap.flag {
        return Some(format!("flagged {}", flag.as_str()));
    }
    if kind == ActionKind::Refund && swap.preimage.is_some() {
        return Some("preimage on record".to_string());
    }
    None
}

/// Chain, contract and call for an action on `swap`
fn target(swap: &Swap, kind: ActionKind) -> RelayerResult<(ChainId, Address, HtlcMethod)> {
    match kind {
        ActionKind::Unlock => {
            let htlc = swap.counter_htlc.ok_or_else(|| {
                RelayerError::Internal(format!("no counter HTLC for {}", short(&swap.hash_lock)))
            })?;
            let preimage = swap.preimage.ok_or_else(|| {
                RelayerError::Internal(format!("no preimage for {}", short(&swap.hash_lock)))
            })?;
            Ok((swap.counter_chain, htlc, HtlcMethod::Unlock { preimage }))
        }
        ActionKind::Refund => Ok((swap.origin_chain, swap.origin_htlc, HtlcMethod::Refund)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{chain_params, FakeGateway};
    use crate::chain::{HtlcInfo, MockChainGateway, TxReceipt};
    use crate::state::swap::tests::lock_record;
    use crate::state::MemoryStore;
    use ethers::types::H256;
    use std::sync::atomic::AtomicU32;

    const ORIGIN: ChainId = 1;
    const COUNTER: ChainId = 2;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    fn open() -> HtlcInfo {
        HtlcInfo {
            receiver: None,
            state: HtlcState::Open,
        }
    }

    fn executor(
        store: Arc<MemoryStore>,
        origin: Arc<dyn crate::chain::ChainGateway>,
        counter: Arc<dyn crate::chain::ChainGateway>,
        max_attempts: u32,
    ) -> ActionExecutor {
        let chains = Arc::new(ChainManager::new());
        chains.register(chain_params(ORIGIN), origin);
        chains.register(chain_params(COUNTER), counter);
        ActionExecutor::new(chains, store, policy(max_attempts), Duration::from_secs(1))
    }

    /// Swap locked on both chains with the preimage known, moved to `status`
    async fn swap_in(store: &MemoryStore, hash: HashLock, status: SwapStatus, preimage: bool) {
        store.upsert_on_lock(lock_record(hash, ORIGIN, COUNTER)).await.unwrap();
        store.upsert_on_lock(lock_record(hash, COUNTER, ORIGIN)).await.unwrap();
        if preimage {
            store.record_preimage(hash, H256::repeat_byte(0x5e)).await.unwrap();
        }
        store
            .transition(hash, SwapStatus::Locked, status)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unlock_retries_transient_failures() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(1);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        let calls = Arc::new(AtomicU32::new(0));
        let mut counter = MockChainGateway::new();
        counter.expect_chain_id().return_const(COUNTER);
        counter.expect_htlc_info().returning(|_| Ok(open()));
        let seen = calls.clone();
        counter
            .expect_submit_transaction()
            .times(3)
            .returning(move |call| {
                assert_eq!(
                    call.method,
                    HtlcMethod::Unlock {
                        preimage: H256::repeat_byte(0x5e)
                    }
                );
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(RelayerError::TransientNetwork {
                        chain_id: COUNTER,
                        message: "timeout".into(),
                    })
                } else {
                    Ok(H256::repeat_byte(0xaa))
                }
            });
        counter
            .expect_wait_for_confirmation()
            .times(1)
            .returning(|tx_hash, _, _| {
                Ok(TxReceipt {
                    tx_hash,
                    block_number: 7,
                    gas_used: None,
                })
            });

        let executor = executor(
            store.clone(),
            Arc::new(FakeGateway::new(ORIGIN)),
            Arc::new(counter),
            5,
        );
        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Unlock))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Completed(SwapStatus::Relayed));
        let swap = store.get(hash).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::Relayed);
        assert_eq!(swap.attempt_count, 3);
        assert_eq!(store.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(2);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        let counter = Arc::new(FakeGateway::new(COUNTER));
        counter.fail_all_submissions();
        let executor = executor(store.clone(), Arc::new(FakeGateway::new(ORIGIN)), counter.clone(), 4);

        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Unlock))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Flagged(SwapFlag::RetriesExhausted));
        assert_eq!(counter.submissions().len(), 4);
        let swap = store.get(hash).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::Relaying);
        assert_eq!(swap.flag, Some(SwapFlag::RetriesExhausted));
        assert_eq!(swap.attempt_count, 4);
    }

    #[tokio::test]
    async fn test_revert_reconciles_to_refunded() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(3);
        swap_in(&store, hash, SwapStatus::Refunding, false).await;

        let reads = Arc::new(AtomicU32::new(0));
        let mut origin = MockChainGateway::new();
        origin.expect_chain_id().return_const(ORIGIN);
        let seen = reads.clone();
        origin.expect_htlc_info().times(2).returning(move |_| {
            let state = if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                HtlcState::Open
            } else {
                HtlcState::Refunded
            };
            Ok(HtlcInfo {
                receiver: None,
                state,
            })
        });
        origin
            .expect_submit_transaction()
            .times(1)
            .returning(|_| Ok(H256::repeat_byte(0xbb)));
        origin.expect_wait_for_confirmation().times(1).returning(|_, _, _| {
            Err(RelayerError::ContractRevert {
                chain_id: ORIGIN,
                reason: "already refunded".into(),
            })
        });

        let executor = executor(store.clone(), Arc::new(origin), Arc::new(FakeGateway::new(COUNTER)), 5);
        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Refund))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Reconciled(SwapStatus::Refunded));
        let swap = store.get(hash).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::Refunded);
        assert_eq!(swap.attempt_count, 1);
        assert_eq!(swap.flag, None);
    }

    #[tokio::test]
    async fn test_confirmation_timeout_flags_and_keeps_status() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(4);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        let counter = Arc::new(FakeGateway::new(COUNTER));
        counter.time_out_confirmations();
        let executor = executor(store.clone(), Arc::new(FakeGateway::new(ORIGIN)), counter, 3);

        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Unlock))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Flagged(SwapFlag::ConfirmationTimeout));
        let swap = store.get(hash).await.unwrap().unwrap();
        assert_eq!(swap.status, SwapStatus::Relaying);
        assert_eq!(swap.flag, Some(SwapFlag::ConfirmationTimeout));
    }

    #[tokio::test]
    async fn test_settled_htlc_is_reconciled_without_gas() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(5);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        let counter = Arc::new(FakeGateway::new(COUNTER));
        counter.set_htlc_state(Address::from_low_u64_be(COUNTER), HtlcState::Unlocked);
        let executor = executor(store.clone(), Arc::new(FakeGateway::new(ORIGIN)), counter.clone(), 3);

        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Unlock))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Reconciled(SwapStatus::Relayed));
        assert!(counter.submissions().is_empty());
    }

    fn unlock_call(htlc: Address) -> HtlcCall {
        HtlcCall {
            contract: htlc,
            method: HtlcMethod::Unlock {
                preimage: H256::repeat_byte(0x5e),
            },
        }
    }

    async fn record_earlier_unlock(store: &MemoryStore, hash: HashLock, tx_hash: H256) {
        store
            .record_submission(&Submission {
                action_id: Uuid::new_v4(),
                hash_lock: hash,
                kind: ActionKind::Unlock,
                chain_id: COUNTER,
                tx_hash,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_unlock_from_earlier_run_is_not_resent() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(7);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        // broadcast before a restart and still unmined
        let counter = Arc::new(FakeGateway::new(COUNTER));
        let htlc = Address::from_low_u64_be(COUNTER);
        let tx_hash = counter.broadcast_pending(unlock_call(htlc));
        record_earlier_unlock(&store, hash, tx_hash).await;

        let executor = executor(store.clone(), Arc::new(FakeGateway::new(ORIGIN)), counter.clone(), 3);
        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Unlock))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Completed(SwapStatus::Relayed));
        assert!(counter.submissions().is_empty());
        assert_eq!(store.submissions().len(), 1);
        assert_eq!(counter.htlc_state(htlc), HtlcState::Unlocked);
    }

    #[tokio::test]
    async fn test_dropped_unlock_is_resubmitted_once() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(8);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        // the earlier transaction never reached the chain
        record_earlier_unlock(&store, hash, H256::repeat_byte(0xdd)).await;

        let counter = Arc::new(FakeGateway::new(COUNTER));
        let executor = executor(store.clone(), Arc::new(FakeGateway::new(ORIGIN)), counter.clone(), 3);
        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Unlock))
            .await
            .unwrap();

        assert_eq!(outcome, ActionOutcome::Completed(SwapStatus::Relayed));
        assert_eq!(counter.submissions().len(), 1);
        assert_eq!(store.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_and_stale_actions_do_nothing() {
        let store = Arc::new(MemoryStore::new());
        let hash = H256::repeat_byte(6);
        swap_in(&store, hash, SwapStatus::Relaying, true).await;

        let counter = Arc::new(FakeGateway::new(COUNTER));
        let executor = executor(store.clone(), Arc::new(FakeGateway::new(ORIGIN)), counter.clone(), 3);

        let cancelled = Action::new(hash, ActionKind::Unlock);
        cancelled.cancel.store(true, Ordering::SeqCst);
        assert_eq!(executor.execute(&cancelled).await.unwrap(), ActionOutcome::Cancelled);

        // a refund scheduled for a swap that is now relaying is stale
        let outcome = executor
            .execute(&Action::new(hash, ActionKind::Refund))
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Skipped(_)));
        assert!(counter.submissions().is_empty());
    }
}
