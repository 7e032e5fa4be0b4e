//! Error types for the HTLC relayer

use crate::hashlock::{ChainId, HashLock};
use crate::state::SwapStatus;

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// RPC timeout or connection loss. Retried with backoff.
    #[error("Transient network error on chain {chain_id}: {message}")]
    TransientNetwork { chain_id: ChainId, message: String },

    /// Nonce too low / replacement underpriced. Retried after a nonce refresh.
    #[error("Nonce conflict on chain {chain_id}: {message}")]
    NonceConflict { chain_id: ChainId, message: String },

    /// The HTLC rejected the call. Never retried; reconciled against on-chain state.
    #[error("Contract reverted on chain {chain_id}: {reason}")]
    ContractRevert { chain_id: ChainId, reason: String },

    /// Compare-and-swap mismatch: another actor already advanced the swap.
    #[error("Stale state for swap {hash_lock:?}: expected {expected}, found {actual}")]
    StaleState {
        hash_lock: HashLock,
        expected: SwapStatus,
        actual: SwapStatus,
    },

    /// Two different preimages for one hash lock. Fatal for that swap.
    #[error("Conflicting preimage for swap {hash_lock:?}")]
    Conflict { hash_lock: HashLock },

    /// A refund was requested for a swap whose preimage is already known.
    #[error("Refund preempted for swap {hash_lock:?}: preimage on record")]
    RefundPreempted { hash_lock: HashLock },

    #[error("Swap {hash_lock:?} is frozen pending operator review")]
    SwapFrozen { hash_lock: HashLock },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SwapStatus, to: SwapStatus },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: ChainId },

    #[error("Swap {hash_lock:?} not found")]
    SwapNotFound { hash_lock: HashLock },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::TransientNetwork { .. }
                | RelayerError::NonceConflict { .. }
                | RelayerError::Timeout { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Conflict { .. }
                | RelayerError::ContractRevert { .. }
                | RelayerError::Wallet(_)
                | RelayerError::Database(_)
        )
    }

    /// Another actor already handled the swap; not a failure.
    pub fn is_stale(&self) -> bool {
        matches!(self, RelayerError::StaleState { .. })
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let transient = RelayerError::TransientNetwork {
            chain_id: 1,
            message: "connection reset".into(),
        };
        let revert = RelayerError::ContractRevert {
            chain_id: 1,
            reason: "already unlocked".into(),
        };

        assert!(transient.is_retryable());
        assert!(!transient.should_alert());
        assert!(!revert.is_retryable());
        assert!(revert.should_alert());
        assert!(RelayerError::Timeout {
            operation: "send".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_stale_is_not_an_alert() {
        let stale = RelayerError::StaleState {
            hash_lock: HashLock::zero(),
            expected: SwapStatus::Locked,
            actual: SwapStatus::Relayed,
        };
        assert!(stale.is_stale());
        assert!(!stale.is_retryable());
        assert!(!stale.should_alert());
    }
}
