//! Scriptable in-memory chain used by unit and scenario tests

use super::{ChainGateway, ChainParams, HtlcCall, HtlcInfo, HtlcMethod, HtlcState, TxReceipt};
use crate::config::TimeLockKind;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{RawEvent, RawEventKind};
use crate::hashlock::{ChainId, HashLock, Preimage};

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

pub(crate) fn chain_params(chain_id: ChainId) -> ChainParams {
    ChainParams {
        chain_id,
        name: format!("chain-{}", chain_id),
        confirmation_depth: 2,
        tx_confirmations: 1,
        time_lock_kind: TimeLockKind::Block,
        poll_interval: Duration::from_millis(5),
        max_block_range: 100,
        start_block: 0,
        factories: Vec::new(),
        htlcs: Vec::new(),
    }
}

pub(crate) fn raw_event(chain_id: ChainId, block: u64, log_index: u64, block_hash: H256) -> RawEvent {
    RawEvent {
        chain_id,
        address: Address::repeat_byte(0x77),
        kind: RawEventKind::Refunded {
            sender: Address::zero(),
            amount: U256::zero(),
        },
        block_number: block,
        block_hash,
        tx_hash: H256::from_low_u64_be(block),
        log_index,
    }
}

#[derive(Default)]
struct FakeState {
    head: u64,
    timestamp: u64,
    logs: Vec<RawEvent>,
    /// blocks whose canonical hash changed after a reorg
    replaced: HashMap<u64, H256>,
    htlcs: HashMap<Address, HtlcInfo>,
    submit_failures: u32,
    fail_all_submissions: bool,
    confirmation_timeout: bool,
    submissions: Vec<HtlcCall>,
    /// broadcast but not yet mined
    pending: HashMap<H256, HtlcCall>,
    outcomes: HashMap<H256, bool>,
    next_tx: u64,
}

pub(crate) struct FakeGateway {
    chain_id: ChainId,
    state: Mutex<FakeState>,
}

impl FakeGateway {
    pub(crate) fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            state: Mutex::new(FakeState {
                head: 100,
                timestamp: 1_700_000_000,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn canonical_hash(&self, block: u64) -> H256 {
        self.state()
            .replaced
            .get(&block)
            .copied()
            .unwrap_or_else(|| H256::from_low_u64_be((self.chain_id << 32) | block))
    }

    pub(crate) fn head(&self) -> u64 {
        self.state().head
    }

    pub(crate) fn set_head(&self, head: u64) {
        self.state().head = head;
    }

    pub(crate) fn advance(&self, blocks: u64) {
        self.state().head += blocks;
    }

    /// Replace `block` with a sibling; logs previously emitted there vanish
    pub(crate) fn reorg(&self, block: u64) {
        let mut state = self.state();
        state.replaced.insert(block, H256::from_low_u64_be(0xdead_0000 + block));
        state.logs.retain(|e| e.block_number != block);
    }

    fn emit(&self, address: Address, kind: RawEventKind, block: u64) -> RawEvent {
        let block_hash = self.canonical_hash(block);
        let mut state = self.state();
        let log_index = state.logs.iter().filter(|e| e.block_number == block).count() as u64;
        let event = RawEvent {
            chain_id: self.chain_id,
            address,
            kind,
            block_number: block,
            block_hash,
            tx_hash: H256::from_low_u64_be(((self.chain_id << 40) | (block << 8)) + log_index),
            log_index,
        };
        state.logs.push(event.clone());
        event
    }

    pub(crate) fn emit_lock(
        &self,
        htlc: Address,
        hash_lock: HashLock,
        time_lock: u64,
        block: u64,
    ) -> RawEvent {
        self.state().htlcs.entry(htlc).or_insert(HtlcInfo {
            receiver: Some(Address::repeat_byte(0xbb)),
            state: HtlcState::Open,
        });
        self.emit(
            htlc,
            RawEventKind::Locked {
                sender: Address::repeat_byte(0xaa),
                amount: U256::from(1_000u64),
                hash_lock,
                time_lock,
            },
            block,
        )
    }

    pub(crate) fn emit_unlock(&self, htlc: Address, preimage: Preimage, block: u64) -> RawEvent {
        self.set_htlc_state(htlc, HtlcState::Unlocked);
        self.emit(
            htlc,
            RawEventKind::Unlocked {
                receiver: Address::repeat_byte(0xbb),
                amount: U256::from(1_000u64),
                preimage,
            },
            block,
        )
    }

    pub(crate) fn emit_refund(&self, htlc: Address, block: u64) -> RawEvent {
        self.set_htlc_state(htlc, HtlcState::Refunded);
        self.emit(
            htlc,
            RawEventKind::Refunded {
                sender: Address::repeat_byte(0xaa),
                amount: U256::from(1_000u64),
            },
            block,
        )
    }

    pub(crate) fn emit_deployed(&self, factory: Address, htlc: Address, block: u64) -> RawEvent {
        self.emit(factory, RawEventKind::HtlcDeployed { htlc }, block)
    }

    pub(crate) fn set_htlc_state(&self, htlc: Address, htlc_state: HtlcState) {
        let mut state = self.state();
        let info = state.htlcs.entry(htlc).or_insert(HtlcInfo {
            receiver: None,
            state: HtlcState::Open,
        });
        info.state = htlc_state;
    }

    pub(crate) fn htlc_state(&self, htlc: Address) -> HtlcState {
        self.state()
            .htlcs
            .get(&htlc)
            .map(|i| i.state)
            .unwrap_or(HtlcState::Open)
    }

    pub(crate) fn set_timestamp(&self, timestamp: u64) {
        self.state().timestamp = timestamp;
    }

    /// The next `n` submissions fail with a transient network error
    pub(crate) fn fail_next_submissions(&self, n: u32) {
        self.state().submit_failures = n;
    }

    pub(crate) fn fail_all_submissions(&self) {
        self.state().fail_all_submissions = true;
    }

    pub(crate) fn time_out_confirmations(&self) {
        self.state().confirmation_timeout = true;
    }

    pub(crate) fn submissions(&self) -> Vec<HtlcCall> {
        self.state().submissions.clone()
    }

    /// A transaction sent by an earlier process; it lands when first awaited
    pub(crate) fn broadcast_pending(&self, call: HtlcCall) -> H256 {
        let mut state = self.state();
        let tx_hash = state.next_tx_hash();
        state.pending.insert(tx_hash, call);
        tx_hash
    }
}

impl FakeState {
    fn next_tx_hash(&mut self) -> H256 {
        self.next_tx += 1;
        H256::from_low_u64_be(0x7000_0000 + self.next_tx)
    }

    /// Apply `call` to its HTLC; reverts when the HTLC is already settled
    fn mine(&mut self, tx_hash: H256, call: HtlcCall) {
        let info = self.htlcs.entry(call.contract).or_insert(HtlcInfo {
            receiver: None,
            state: HtlcState::Open,
        });
        let succeeded = info.state == HtlcState::Open;
        if succeeded {
            info.state = match call.method {
                HtlcMethod::Unlock { .. } => HtlcState::Unlocked,
                HtlcMethod::Refund => HtlcState::Refunded,
            };
        }
        self.outcomes.insert(tx_hash, succeeded);
    }
}

#[async_trait]
impl ChainGateway for FakeGateway {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn current_block_height(&self) -> RelayerResult<u64> {
        Ok(self.head())
    }

    async fn latest_block_timestamp(&self) -> RelayerResult<u64> {
        Ok(self.state().timestamp)
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<H256>> {
        if number > self.head() {
            return Ok(None);
        }
        Ok(Some(self.canonical_hash(number)))
    }

    async fn fetch_events(
        &self,
        addresses: Vec<Address>,
        from: u64,
        to: u64,
    ) -> RelayerResult<Vec<RawEvent>> {
        let state = self.state();
        Ok(state
            .logs
            .iter()
            .filter(|e| e.block_number >= from && e.block_number <= to)
            .filter(|e| addresses.contains(&e.address))
            .cloned()
            .collect())
    }

    async fn submit_transaction(&self, call: HtlcCall) -> RelayerResult<H256> {
        let mut state = self.state();
        state.submissions.push(call);

        if state.fail_all_submissions || state.submit_failures > 0 {
            state.submit_failures = state.submit_failures.saturating_sub(1);
            return Err(RelayerError::TransientNetwork {
                chain_id: self.chain_id,
                message: "connection reset by peer".to_string(),
            });
        }

        let tx_hash = state.next_tx_hash();
        state.mine(tx_hash, call);

        Ok(tx_hash)
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        _confirmations: u64,
        _timeout: Duration,
    ) -> RelayerResult<TxReceipt> {
        let mut state = self.state();
        if let Some(call) = state.pending.remove(&tx_hash) {
            state.mine(tx_hash, call);
        }
        if state.confirmation_timeout {
            return Err(RelayerError::Timeout {
                operation: format!("confirmation of {:?}", tx_hash),
            });
        }

        match state.outcomes.get(&tx_hash) {
            Some(true) => Ok(TxReceipt {
                tx_hash,
                block_number: state.head,
                gas_used: Some(U256::from(50_000u64)),
            }),
            Some(false) => Err(RelayerError::ContractRevert {
                chain_id: self.chain_id,
                reason: "execution reverted: HTLC already settled".to_string(),
            }),
            None => Err(RelayerError::Internal(format!("unknown tx {:?}", tx_hash))),
        }
    }

    async fn htlc_info(&self, htlc: Address) -> RelayerResult<HtlcInfo> {
        Ok(self.state().htlcs.get(&htlc).copied().unwrap_or(HtlcInfo {
            receiver: None,
            state: HtlcState::Open,
        }))
    }
}
