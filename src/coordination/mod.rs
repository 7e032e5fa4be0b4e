//! Relay coordination for hash-locked swaps
//!
//! The coordinator:
//! 1. Consumes domain events from both chains' ingestion pipelines
//! 2. Records locks and revealed preimages in the swap registry
//! 3. Schedules counter-chain unlocks and origin-chain refunds
//! 4. Sweeps pending swaps for expired deadlines and interrupted actions

pub mod engine;

pub use engine::{shard_of, RelayCoordinator, SweepReport};
