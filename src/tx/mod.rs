//! Transaction submission: nonce management, gas pricing, and the action executor

mod backoff;
mod executor;
mod gas;
mod nonce;

pub use backoff::RetryPolicy;
pub use executor::{Action, ActionExecutor, ActionOutcome};
pub use gas::{build_transaction, GasEstimator};
pub use nonce::NonceManager;
