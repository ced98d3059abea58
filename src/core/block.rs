//! Block implementation for the node
//!
//! A block is a nonce, a header committing to the body through `body_hash`,
//! and a body of opaque blobs. Field order in these structs is the wire
//! contract: it mirrors the fixed field tags of the block schema.

use crate::crypto::{double_sha256, meets_target, work_for_difficulty};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

// =============================================================================
// Block Constants
// =============================================================================

/// Maximum number of blobs carried by one block
pub const MAX_BLOCK_BLOBS: usize = 1_000;

/// Maximum size of a single blob in bytes
pub const MAX_BLOB_SIZE: usize = 64 * 1024;

/// Length of a body hash in bytes (SHA-256)
pub const BODY_HASH_LEN: usize = 32;

// =============================================================================
// Block Errors
// =============================================================================

/// Block validation errors
#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Body hash does not match body")]
    BodyHashMismatch,
    #[error("Invalid proof of work")]
    InvalidProofOfWork,
    #[error("Too many blobs: {0} (max: {1})")]
    TooManyBlobs(usize, usize),
    #[error("Blob too large: {0} bytes (max: {1})")]
    BlobTooLarge(usize, usize),
    #[error("Timestamp is not a finite number: {0}")]
    NonFiniteTimestamp(f64),
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Seconds since the Unix epoch with microsecond precision
pub fn now_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// =============================================================================
// Block Hash
// =============================================================================

/// Block identifier: the proof-of-work digest of the block
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockHash(pub [u8; 32]);

impl BlockHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64 character hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

// =============================================================================
// Block Body
// =============================================================================

/// Ordered sequence of opaque payload units
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockBody {
    pub blobs: Vec<Vec<u8>>,
}

impl BlockBody {
    pub fn new(blobs: Vec<Vec<u8>>) -> Self {
        Self { blobs }
    }

    /// SHA-256 of the serialized body.
    ///
    /// Hashed incrementally in the bincode layout (u64 LE counts and lengths)
    /// so the digest equals `sha256(bincode::serialize(body))`.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update((self.blobs.len() as u64).to_le_bytes());
        for blob in &self.blobs {
            hasher.update((blob.len() as u64).to_le_bytes());
            hasher.update(blob);
        }
        hasher.finalize().into()
    }
}

// =============================================================================
// Block Header
// =============================================================================

/// Block header committing to the body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Caller-chosen randomness diversifying the search space
    pub entropy: u32,
    /// Seconds since epoch when the candidate was built
    pub timestamp: f64,
    /// Difficulty the proof of work was searched at
    pub difficulty: u32,
    /// Digest of the serialized body
    pub body_hash: Vec<u8>,
}

impl BlockHeader {
    /// Build a header for `body` at the given difficulty
    pub fn for_body(body: &BlockBody, entropy: u32, timestamp: f64, difficulty: u32) -> Self {
        Self {
            entropy,
            timestamp,
            difficulty,
            body_hash: body.digest().to_vec(),
        }
    }

    /// Proof-of-work preimage for a nonce.
    ///
    /// `entropy || timestamp bits || difficulty || len(body_hash) || body_hash || nonce`,
    /// every integer big-endian.
    pub fn pow_preimage(&self, nonce: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(24 + self.body_hash.len());
        data.extend_from_slice(&self.entropy.to_be_bytes());
        data.extend_from_slice(&self.timestamp.to_bits().to_be_bytes());
        data.extend_from_slice(&self.difficulty.to_be_bytes());
        data.extend_from_slice(&(self.body_hash.len() as u32).to_be_bytes());
        data.extend_from_slice(&self.body_hash);
        data.extend_from_slice(&nonce.to_be_bytes());
        data
    }

    /// Double SHA-256 of the preimage
    pub fn pow_digest(&self, nonce: u32) -> [u8; 32] {
        double_sha256(&self.pow_preimage(nonce))
    }
}

/// Proof-of-work predicate shared by the miner and the validator
pub fn is_valid_pow(header: &BlockHeader, nonce: u32, difficulty: u32) -> bool {
    meets_target(&header.pow_digest(nonce), difficulty)
}

// =============================================================================
// Block
// =============================================================================

/// A mined block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Proof-of-work solution
    pub nonce: u32,
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(nonce: u32, header: BlockHeader, body: BlockBody) -> Self {
        Self {
            nonce,
            header,
            body,
        }
    }

    /// Block id, the proof-of-work digest
    pub fn hash(&self) -> BlockHash {
        BlockHash(self.header.pow_digest(self.nonce))
    }

    /// Check if the proof of work is valid at the header's difficulty
    pub fn is_valid_pow(&self) -> bool {
        is_valid_pow(&self.header, self.nonce, self.header.difficulty)
    }

    /// Verify that `body_hash` commits to the body
    pub fn verify_body_hash(&self) -> bool {
        self.header.body_hash.len() == BODY_HASH_LEN
            && self.header.body_hash[..] == self.body.digest()[..]
    }

    /// This block's contribution to cumulative chain work
    pub fn chain_cost(&self) -> u64 {
        work_for_difficulty(self.header.difficulty)
    }

    /// Validate limits, body hash and proof of work
    pub fn validate(&self) -> Result<(), BlockError> {
        if !self.header.timestamp.is_finite() {
            return Err(BlockError::NonFiniteTimestamp(self.header.timestamp));
        }

        let count = self.body.blobs.len();
        if count > MAX_BLOCK_BLOBS {
            return Err(BlockError::TooManyBlobs(count, MAX_BLOCK_BLOBS));
        }

        if let Some(blob) = self.body.blobs.iter().find(|b| b.len() > MAX_BLOB_SIZE) {
            return Err(BlockError::BlobTooLarge(blob.len(), MAX_BLOB_SIZE));
        }

        if !self.verify_body_hash() {
            return Err(BlockError::BodyHashMismatch);
        }

        if !self.is_valid_pow() {
            return Err(BlockError::InvalidProofOfWork);
        }

        Ok(())
    }

    /// Serialize block to wire bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, BlockError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize block from wire bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, BlockError> {
        Ok(bincode::deserialize(data)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Brute-force a valid block; only for low difficulties
    pub(crate) fn mine_test_block(blobs: Vec<Vec<u8>>, difficulty: u32, timestamp: f64) -> Block {
        let body = BlockBody::new(blobs);
        let header = BlockHeader::for_body(&body, 7, timestamp, difficulty);
        let nonce = (0..=u32::MAX)
            .find(|n| is_valid_pow(&header, *n, difficulty))
            .unwrap();
        Block::new(nonce, header, body)
    }

    #[test]
    fn test_body_digest_matches_bincode_layout() {
        let body = BlockBody::new(vec![b"tx1".to_vec(), vec![], b"another blob".to_vec()]);
        let encoded = bincode::serialize(&body).unwrap();
        assert_eq!(body.digest(), crate::crypto::sha256(&encoded));
    }

    #[test]
    fn test_body_order_matters() {
        let a = BlockBody::new(vec![b"a".to_vec(), b"b".to_vec()]);
        let b = BlockBody::new(vec![b"b".to_vec(), b"a".to_vec()]);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_mined_block_validates() {
        let block = mine_test_block(vec![b"payload".to_vec()], 16, 1_700_000_000.0);
        assert!(block.verify_body_hash());
        assert!(block.is_valid_pow());
        block.validate().unwrap();
    }

    #[test]
    fn test_tampered_body_rejected() {
        let mut block = mine_test_block(vec![b"payload".to_vec()], 1, 1_700_000_000.0);
        block.body.blobs.push(b"smuggled".to_vec());
        assert!(matches!(block.validate(), Err(BlockError::BodyHashMismatch)));
    }

    #[test]
    fn test_insufficient_work_rejected() {
        let body = BlockBody::default();
        let header = BlockHeader::for_body(&body, 1, 1_700_000_000.0, u32::MAX);
        // Find a nonce that fails the target; nearly every nonce does
        let nonce = (0..)
            .find(|n| !is_valid_pow(&header, *n, u32::MAX))
            .unwrap();
        let block = Block::new(nonce, header, body);
        assert!(matches!(
            block.validate(),
            Err(BlockError::InvalidProofOfWork)
        ));
    }

    #[test]
    fn test_non_finite_timestamp_rejected() {
        for timestamp in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let block = mine_test_block(vec![], 1, timestamp);
            assert!(matches!(
                block.validate(),
                Err(BlockError::NonFiniteTimestamp(_))
            ));
        }
    }

    #[test]
    fn test_wire_roundtrip_preserves_hash() {
        let block = mine_test_block(vec![b"x".to_vec(), b"y".to_vec()], 4, 1_700_000_123.5);
        let decoded = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn test_garbage_does_not_decode() {
        assert!(Block::from_bytes(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_block_hash_hex() {
        let block = mine_test_block(vec![], 1, 1.0);
        let hash = block.hash();
        assert_eq!(BlockHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(BlockHash::from_hex("zz").is_err());
    }
}
