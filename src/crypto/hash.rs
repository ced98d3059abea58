//! Cryptographic hashing utilities for the node
//!
//! Provides the SHA-256 based digests used for body hashes and block ids,
//! and the proof-of-work target law shared by the miner and the validator.

use primitive_types::U256;
use sha2::{Digest, Sha256};

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
/// Used for proof-of-work digests and block ids
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Proof-of-work target for a difficulty.
///
/// A digest is accepted when, read as a big-endian 256-bit integer, it is
/// `<= (2^256 - 1) / max(difficulty, 1)`. Difficulty 0 and 1 accept every
/// digest; each increment of difficulty shrinks the accepted range.
pub fn pow_target(difficulty: u32) -> U256 {
    U256::MAX / U256::from(difficulty.max(1))
}

/// Checks if a digest meets the target for `difficulty`
pub fn meets_target(digest: &[u8; 32], difficulty: u32) -> bool {
    U256::from_big_endian(digest) <= pow_target(difficulty)
}

/// Work contributed by a block mined at `difficulty`.
///
/// Proportional to the expected number of hashes needed to meet the target.
pub fn work_for_difficulty(difficulty: u32) -> u64 {
    u64::from(difficulty.max(1))
}
