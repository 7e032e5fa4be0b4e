//! Swap record and its lifecycle rules
//!
//! Both stores load a [`SwapSlot`] under a per-hash-lock lock, apply one of the
//! methods below, and persist the result, so the rules live in one place.

use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{ChainId, HashLock, Preimage};

use chrono::{DateTime, Utc};
use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapStatus {
    Locked,
    Relaying,
    Relayed,
    Refunding,
    Refunded,
    ExpiredUnresolved,
}

impl SwapStatus {
    pub const ALL: [SwapStatus; 6] = [
        SwapStatus::Locked,
        SwapStatus::Relaying,
        SwapStatus::Relayed,
        SwapStatus::Refunding,
        SwapStatus::Refunded,
        SwapStatus::ExpiredUnresolved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SwapStatus::Locked => "locked",
            SwapStatus::Relaying => "relaying",
            SwapStatus::Relayed => "relayed",
            SwapStatus::Refunding => "refunding",
            SwapStatus::Refunded => "refunded",
            SwapStatus::ExpiredUnresolved => "expired_unresolved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapStatus::Relayed | SwapStatus::Refunded | SwapStatus::ExpiredUnresolved
        )
    }

    /// Forward edges of the lifecycle.
    ///
    /// `Locked -> Relayed/Refunded` record an outcome observed on chain without
    /// our own action. `Refunding -> Relaying/Relayed` is relay preemption of a
    /// pending refund once a preimage is known.
    pub fn can_transition_to(&self, to: SwapStatus) -> bool {
        use SwapStatus::*;
        matches!(
            (self, to),
            (Locked, Relaying)
                | (Locked, Refunding)
                | (Locked, Relayed)
                | (Locked, Refunded)
                | (Locked, ExpiredUnresolved)
                | (Relaying, Relayed)
                | (Relaying, Refunded)
                | (Refunding, Refunded)
                | (Refunding, Relaying)
                | (Refunding, Relayed)
        )
    }
}

impl fmt::Display for SwapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SwapStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwapStatus::ALL
            .iter()
            .find(|status| status.as_str() == s.to_ascii_lowercase())
            .copied()
            .ok_or_else(|| RelayerError::Internal(format!("unknown swap status '{}'", s)))
    }
}

/// Operator-visible marker explaining why a swap needs attention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwapFlag {
    /// Two different preimages were seen; the swap is frozen
    PreimageConflict,
    RetriesExhausted,
    ConfirmationTimeout,
    ContractReverted,
    /// Deadline passed with a preimage but nowhere to relay it
    Unresolvable,
}

impl SwapFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapFlag::PreimageConflict => "preimage_conflict",
            SwapFlag::RetriesExhausted => "retries_exhausted",
            SwapFlag::ConfirmationTimeout => "confirmation_timeout",
            SwapFlag::ContractReverted => "contract_reverted",
            SwapFlag::Unresolvable => "unresolvable",
        }
    }
}

impl FromStr for SwapFlag {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preimage_conflict" => Ok(SwapFlag::PreimageConflict),
            "retries_exhausted" => Ok(SwapFlag::RetriesExhausted),
            "confirmation_timeout" => Ok(SwapFlag::ConfirmationTimeout),
            "contract_reverted" => Ok(SwapFlag::ContractReverted),
            "unresolvable" => Ok(SwapFlag::Unresolvable),
            other => Err(RelayerError::Internal(format!("unknown swap flag '{}'", other))),
        }
    }
}

/// Lock data carried by a `LockObserved` domain event
#[derive(Debug, Clone)]
pub struct LockRecord {
    pub hash_lock: HashLock,
    pub chain: ChainId,
    pub counter_chain: ChainId,
    pub htlc: Address,
    pub amount: U256,
    pub sender: Address,
    pub receiver: Option<Address>,
    pub time_lock: u64,
}

/// One swap per hash lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Swap {
    pub hash_lock: HashLock,
    pub origin_chain: ChainId,
    pub counter_chain: ChainId,
    pub origin_htlc: Address,
    pub counter_htlc: Option<Address>,
    pub amount: U256,
    pub sender: Address,
    pub receiver: Option<Address>,
    pub time_lock: u64,
    pub preimage: Option<Preimage>,
    pub status: SwapStatus,
    pub last_relay_attempt: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub flag: Option<SwapFlag>,
    pub last_error: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Swap {
    pub fn from_lock(record: &LockRecord, preimage: Option<Preimage>, now: DateTime<Utc>) -> Self {
        Self {
            hash_lock: record.hash_lock,
            origin_chain: record.chain,
            counter_chain: record.counter_chain,
            origin_htlc: record.htlc,
            counter_htlc: None,
            amount: record.amount,
            sender: record.sender,
            receiver: record.receiver,
            time_lock: record.time_lock,
            preimage,
            status: SwapStatus::Locked,
            last_relay_attempt: None,
            attempt_count: 0,
            flag: None,
            last_error: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.flag == Some(SwapFlag::PreimageConflict)
    }

    /// Preimage and counter HTLC are both known
    pub fn can_relay(&self) -> bool {
        self.preimage.is_some() && self.counter_htlc.is_some()
    }

    /// HTLC address of this swap on `chain`
    pub fn htlc_on(&self, chain: ChainId) -> Option<Address> {
        if chain == self.origin_chain {
            Some(self.origin_htlc)
        } else if chain == self.counter_chain {
            self.counter_htlc
        } else {
            None
        }
    }

    /// Compare-and-swap status update
    pub fn advance(
        &mut self,
        from: SwapStatus,
        to: SwapStatus,
        now: DateTime<Utc>,
    ) -> RelayerResult<()> {
        if self.status != from {
            return Err(RelayerError::StaleState {
                hash_lock: self.hash_lock,
                expected: from,
                actual: self.status,
            });
        }
        if !from.can_transition_to(to) {
            return Err(RelayerError::InvalidStateTransition { from, to });
        }
        if self.is_frozen() && matches!(to, SwapStatus::Relaying | SwapStatus::Refunding) {
            return Err(RelayerError::SwapFrozen {
                hash_lock: self.hash_lock,
            });
        }
        if to == SwapStatus::Refunding && self.preimage.is_some() {
            return Err(RelayerError::RefundPreempted {
                hash_lock: self.hash_lock,
            });
        }
        if from == SwapStatus::Refunding && to != SwapStatus::Refunded && self.preimage.is_none() {
            return Err(RelayerError::InvalidStateTransition { from, to });
        }

        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_flag(&mut self, flag: SwapFlag, message: String, now: DateTime<Utc>) {
        // a conflict freeze is never downgraded by a later, milder flag
        if !self.is_frozen() {
            self.flag = Some(flag);
        }
        self.last_error = Some(message);
        self.updated_at = now;
    }
}

#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    /// First lock for this hash lock
    Created(Swap),
    /// The mirrored HTLC on the counter chain was just learned
    CounterLearned(Swap),
    /// Replay, or nothing new
    Unchanged(Swap),
}

impl UpsertOutcome {
    pub fn swap(&self) -> &Swap {
        match self {
            UpsertOutcome::Created(s)
            | UpsertOutcome::CounterLearned(s)
            | UpsertOutcome::Unchanged(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreimageOutcome {
    Recorded,
    AlreadyKnown,
}

/// Everything a store keeps under one hash lock
#[derive(Debug, Clone, Default)]
pub struct SwapSlot {
    pub swap: Option<Swap>,
    /// Preimage revealed before any lock for the hash was seen
    pub orphan_preimage: Option<Preimage>,
}

impl SwapSlot {
    pub fn apply_lock(&mut self, record: &LockRecord, now: DateTime<Utc>) -> UpsertOutcome {
        match self.swap.as_mut() {
            None => {
                let swap = Swap::from_lock(record, self.orphan_preimage.take(), now);
                self.swap = Some(swap.clone());
                UpsertOutcome::Created(swap)
            }
            Some(swap) => {
                if record.chain == swap.counter_chain && swap.counter_htlc.is_none() {
                    swap.counter_htlc = Some(record.htlc);
                    swap.updated_at = now;
                    UpsertOutcome::CounterLearned(swap.clone())
                } else {
                    if swap.htlc_on(record.chain) != Some(record.htlc) {
                        tracing::warn!(
                            "Second HTLC {:?} on chain {} for hash lock {:?}; keeping {:?}",
                            record.htlc,
                            record.chain,
                            record.hash_lock,
                            swap.htlc_on(record.chain)
                        );
                    }
                    UpsertOutcome::Unchanged(swap.clone())
                }
            }
        }
    }

    pub fn apply_preimage(
        &mut self,
        hash_lock: HashLock,
        preimage: Preimage,
        now: DateTime<Utc>,
    ) -> RelayerResult<PreimageOutcome> {
        let current = match self.swap.as_ref() {
            Some(swap) => swap.preimage,
            None => self.orphan_preimage,
        };

        match current {
            Some(existing) if existing == preimage => Ok(PreimageOutcome::AlreadyKnown),
            Some(_) => Err(RelayerError::Conflict { hash_lock }),
            None => {
                match self.swap.as_mut() {
                    Some(swap) => {
                        swap.preimage = Some(preimage);
                        swap.updated_at = now;
                    }
                    None => self.orphan_preimage = Some(preimage),
                }
                Ok(PreimageOutcome::Recorded)
            }
        }
    }

    pub fn swap_mut(&mut self, hash_lock: HashLock) -> RelayerResult<&mut Swap> {
        self.swap
            .as_mut()
            .ok_or(RelayerError::SwapNotFound { hash_lock })
    }
}
