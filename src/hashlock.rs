//! Shared primitives for hash-locked swaps

use ethers::types::H256;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

/// Numeric chain identifier (EIP-155)
pub type ChainId = u64;

/// Commitment identifying a swap on both chains
pub type HashLock = H256;

/// Secret whose hash equals the hash lock
pub type Preimage = H256;

/// Hash function the HTLC contracts use to derive a hash lock from its preimage
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    #[default]
    Sha256,
    Keccak256,
}

impl HashFunction {
    pub fn hash(&self, preimage: &Preimage) -> HashLock {
        match self {
            HashFunction::Sha256 => H256::from_slice(&Sha256::digest(preimage.as_bytes())),
            HashFunction::Keccak256 => H256::from_slice(&Keccak256::digest(preimage.as_bytes())),
        }
    }

    /// Check that `preimage` opens `hash_lock`
    pub fn verify(&self, hash_lock: &HashLock, preimage: &Preimage) -> bool {
        self.hash(preimage) == *hash_lock
    }
}

/// Short hex rendering for log lines
pub fn short(hash: &H256) -> String {
    let encoded = hex::encode(hash.as_bytes());
    format!("0x{}…", &encoded[..12])
}

/// Parse a 0x-prefixed (or bare) 32-byte hex string
pub fn parse_h256(input: &str) -> Option<H256> {
    let trimmed = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(trimmed).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(H256::from_slice(&bytes))
}
