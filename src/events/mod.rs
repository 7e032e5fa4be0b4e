//! Contract event types and parsing
//!
//! Logs emitted by HTLC contracts and the HTLCFactory are decoded into
//! [`RawEvent`]s at the gateway; ingestion turns final ones into
//! [`DomainEvent`]s for the coordinator.

use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{ChainId, HashLock, Preimage};
use crate::state::{EventKey, LockRecord};

use ethers::abi::RawLog;
use ethers::contract::EthEvent;
use ethers::types::{Address, Log, H256, U256};
use serde::Serialize;

/// `Locked(address sender, uint256 amount, bytes32 hashLock, uint256 timeLock)`
#[derive(Debug, Clone, PartialEq, Eq, EthEvent)]
#[ethevent(name = "Locked", abi = "Locked(address,uint256,bytes32,uint256)")]
pub struct LockedFilter {
    #[ethevent(indexed)]
    pub sender: Address,
    pub amount: U256,
    #[ethevent(indexed)]
    pub hash_lock: [u8; 32],
    pub time_lock: U256,
}

/// `Unlocked(address receiver, uint256 amount, bytes32 preimage)`
#[derive(Debug, Clone, PartialEq, Eq, EthEvent)]
#[ethevent(name = "Unlocked", abi = "Unlocked(address,uint256,bytes32)")]
pub struct UnlockedFilter {
    #[ethevent(indexed)]
    pub receiver: Address,
    pub amount: U256,
    pub preimage: [u8; 32],
}

/// `Refunded(address sender, uint256 amount)`
#[derive(Debug, Clone, PartialEq, Eq, EthEvent)]
#[ethevent(name = "Refunded", abi = "Refunded(address,uint256)")]
pub struct RefundedFilter {
    #[ethevent(indexed)]
    pub sender: Address,
    pub amount: U256,
}

/// `HTLCDeployed(address htlcAddress)` from the factory
#[derive(Debug, Clone, PartialEq, Eq, EthEvent)]
#[ethevent(name = "HTLCDeployed", abi = "HTLCDeployed(address)")]
pub struct HtlcDeployedFilter {
    #[ethevent(indexed)]
    pub htlc_address: Address,
}

/// Decoded payload of a contract log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RawEventKind {
    Locked {
        sender: Address,
        amount: U256,
        hash_lock: HashLock,
        time_lock: u64,
    },
    Unlocked {
        receiver: Address,
        amount: U256,
        preimage: Preimage,
    },
    Refunded {
        sender: Address,
        amount: U256,
    },
    HtlcDeployed {
        htlc: Address,
    },
}

/// A contract log together with its position on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawEvent {
    pub chain_id: ChainId,
    /// Emitting contract
    pub address: Address,
    pub kind: RawEventKind,
    pub block_number: u64,
    pub block_hash: H256,
    pub tx_hash: H256,
    pub log_index: u64,
}

impl RawEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            chain_id: self.chain_id,
            tx_hash: self.tx_hash,
            log_index: self.log_index,
        }
    }

    /// Get event name for metrics
    pub fn name(&self) -> &'static str {
        match self.kind {
            RawEventKind::Locked { .. } => "locked",
            RawEventKind::Unlocked { .. } => "unlocked",
            RawEventKind::Refunded { .. } => "refunded",
            RawEventKind::HtlcDeployed { .. } => "htlc_deployed",
        }
    }
}

/// What the coordinator reacts to
#[derive(Debug, Clone)]
pub enum DomainEvent {
    LockObserved(LockRecord),
    UnlockObserved {
        chain: ChainId,
        hash_lock: HashLock,
        htlc: Address,
        preimage: Preimage,
    },
    RefundObserved {
        chain: ChainId,
        hash_lock: HashLock,
        htlc: Address,
    },
    FactoryDeployed {
        chain: ChainId,
        htlc: Address,
    },
}

impl DomainEvent {
    pub fn hash_lock(&self) -> Option<HashLock> {
        match self {
            DomainEvent::LockObserved(record) => Some(record.hash_lock),
            DomainEvent::UnlockObserved { hash_lock, .. }
            | DomainEvent::RefundObserved { hash_lock, .. } => Some(*hash_lock),
            DomainEvent::FactoryDeployed { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::LockObserved(_) => "lock_observed",
            DomainEvent::UnlockObserved { .. } => "unlock_observed",
            DomainEvent::RefundObserved { .. } => "refund_observed",
            DomainEvent::FactoryDeployed { .. } => "factory_deployed",
        }
    }
}

/// Decode a log into a [`RawEvent`]; `None` for logs the relayer does not consume
pub fn decode_log(chain_id: ChainId, log: &Log) -> RelayerResult<Option<RawEvent>> {
    let topic = match log.topics.first() {
        Some(topic) => *topic,
        None => return Ok(None),
    };
    let raw = RawLog {
        topics: log.topics.clone(),
        data: log.data.to_vec(),
    };

    let kind = if topic == LockedFilter::signature() {
        let event = <LockedFilter as EthEvent>::decode_log(&raw).map_err(parse_error)?;
        RawEventKind::Locked {
            sender: event.sender,
            amount: event.amount,
            hash_lock: H256::from(event.hash_lock),
            time_lock: saturating_u64(event.time_lock),
        }
    } else if topic == UnlockedFilter::signature() {
        let event = <UnlockedFilter as EthEvent>::decode_log(&raw).map_err(parse_error)?;
        RawEventKind::Unlocked {
            receiver: event.receiver,
            amount: event.amount,
            preimage: H256::from(event.preimage),
        }
    } else if topic == RefundedFilter::signature() {
        let event = <RefundedFilter as EthEvent>::decode_log(&raw).map_err(parse_error)?;
        RawEventKind::Refunded {
            sender: event.sender,
            amount: event.amount,
        }
    } else if topic == HtlcDeployedFilter::signature() {
        let event = <HtlcDeployedFilter as EthEvent>::decode_log(&raw).map_err(parse_error)?;
        RawEventKind::HtlcDeployed {
            htlc: event.htlc_address,
        }
    } else {
        return Ok(None);
    };

    let missing = |field: &str| RelayerError::EventParsing(format!("log without {}", field));

    Ok(Some(RawEvent {
        chain_id,
        address: log.address,
        kind,
        block_number: log.block_number.ok_or_else(|| missing("block number"))?.as_u64(),
        block_hash: log.block_hash.ok_or_else(|| missing("block hash"))?,
        tx_hash: log.transaction_hash.ok_or_else(|| missing("transaction hash"))?,
        log_index: log.log_index.ok_or_else(|| missing("log index"))?.as_u64(),
    }))
}

fn parse_error(e: ethers::abi::Error) -> RelayerError {
    RelayerError::EventParsing(e.to_string())
}

fn saturating_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}
