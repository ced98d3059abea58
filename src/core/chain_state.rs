//! Chain State Management
//!
//! The single owner of the authoritative tip. Holds the accepted blocks in
//! memory, the current difficulty, the pending blob pool and a tip generation
//! counter. Every tip change bumps the generation while the write lock is
//! held, so a miner that compares generations can never keep working on a
//! tip that has already been superseded.

use crate::core::block::{
    now_timestamp, Block, BlockBody, BlockError, BlockHash, MAX_BLOB_SIZE, MAX_BLOCK_BLOBS,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Maximum allowed time drift into the future (2 hours in seconds)
pub const MAX_FUTURE_BLOCK_TIME: f64 = 7200.0;

/// Maximum number of blobs waiting in the pending pool
pub const MAX_PENDING_BLOBS: usize = 10_000;

/// Chain-level rejection reasons
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),
    #[error("Duplicate block {0}")]
    DuplicateBlock(BlockHash),
    #[error("Insufficient difficulty: {got} (required: {required})")]
    InsufficientDifficulty { got: u32, required: u32 },
    #[error("Block timestamp {got} is not newer than tip timestamp {tip}")]
    StaleTimestamp { got: f64, tip: f64 },
    #[error("Block timestamp {0} is not a finite number")]
    NonFiniteTimestamp(f64),
    #[error("Block timestamp {0} is too far in the future")]
    FutureTimestamp(f64),
    #[error("Candidate built on generation {built_on}, tip is at generation {current}")]
    Superseded { built_on: u64, current: u64 },
    #[error("Blob too large: {0} bytes (max: {1})")]
    BlobTooLarge(usize, usize),
    #[error("Pending pool full ({0} blobs)")]
    PendingPoolFull(usize),
}

/// Snapshot a miner builds its candidate from
#[derive(Debug, Clone)]
pub struct MiningTemplate {
    /// Tip generation the snapshot was taken at
    pub generation: u64,
    pub difficulty: u32,
    /// Timestamp of the current tip, if any
    pub tip_timestamp: Option<f64>,
    pub body: BlockBody,
}

/// Result of a successful acceptance
#[derive(Debug, Clone)]
pub struct Accepted {
    pub hash: BlockHash,
    /// Number of blocks in the chain after acceptance
    pub height: u64,
    /// Contribution of this block to cumulative work
    pub chain_cost: u64,
    /// Tip generation after acceptance
    pub generation: u64,
}

/// Summary of the chain
#[derive(Debug, Clone)]
pub struct ChainStats {
    pub height: u64,
    pub tip: Option<BlockHash>,
    pub total_work: u128,
    pub difficulty: u32,
    pub pending_blobs: usize,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct ChainInner {
    blocks: Vec<Block>,
    index: HashMap<BlockHash, usize>,
    total_work: u128,
    difficulty: u32,
    pending: Vec<Vec<u8>>,
}

impl ChainInner {
    fn tip(&self) -> Option<&Block> {
        self.blocks.last()
    }
}

/// In-memory authoritative chain tip
#[derive(Debug)]
pub struct ChainState {
    inner: RwLock<ChainInner>,
    generation: AtomicU64,
}

impl ChainState {
    /// Create an empty chain mining at `difficulty`
    pub fn new(difficulty: u32) -> Self {
        Self {
            inner: RwLock::new(ChainInner {
                difficulty,
                ..Default::default()
            }),
            generation: AtomicU64::new(0),
        }
    }

    /// Current tip generation. Polled by the miner for preemption.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn difficulty(&self) -> u32 {
        self.inner.read().difficulty
    }

    /// Consistent snapshot of generation, difficulty and pending body
    pub fn template(&self) -> MiningTemplate {
        let inner = self.inner.read();
        MiningTemplate {
            generation: self.generation(),
            difficulty: inner.difficulty,
            tip_timestamp: inner.tip().map(|b| b.header.timestamp),
            body: BlockBody::new(inner.pending.iter().take(MAX_BLOCK_BLOBS).cloned().collect()),
        }
    }

    /// Accept a block received from the network
    pub fn accept_block(&self, block: Block) -> Result<Accepted, ChainError> {
        block.validate()?;
        self.accept_validated(block)
    }

    /// Accept a block the caller has already run [`Block::validate`] on.
    /// Only the chain rules are checked under the write lock.
    pub(crate) fn accept_validated(&self, block: Block) -> Result<Accepted, ChainError> {
        let mut inner = self.inner.write();
        self.accept_locked(&mut inner, block)
    }

    /// Accept a locally mined block only if the tip has not moved since
    /// `generation`. A solution racing a newer tip is discarded.
    pub fn accept_mined(&self, block: Block, generation: u64) -> Result<Accepted, ChainError> {
        block.validate()?;

        let mut inner = self.inner.write();
        let current = self.generation();
        if current != generation {
            return Err(ChainError::Superseded {
                built_on: generation,
                current,
            });
        }
        self.accept_locked(&mut inner, block)
    }

    fn accept_locked(&self, inner: &mut ChainInner, block: Block) -> Result<Accepted, ChainError> {
        // NaN would slip past every ordering comparison below
        if !block.header.timestamp.is_finite() {
            return Err(ChainError::NonFiniteTimestamp(block.header.timestamp));
        }

        let hash = block.hash();
        if inner.index.contains_key(&hash) {
            return Err(ChainError::DuplicateBlock(hash));
        }

        if block.header.difficulty < inner.difficulty {
            return Err(ChainError::InsufficientDifficulty {
                got: block.header.difficulty,
                required: inner.difficulty,
            });
        }

        if let Some(tip) = inner.tip() {
            if block.header.timestamp <= tip.header.timestamp {
                return Err(ChainError::StaleTimestamp {
                    got: block.header.timestamp,
                    tip: tip.header.timestamp,
                });
            }
        }

        if block.header.timestamp > now_timestamp() + MAX_FUTURE_BLOCK_TIME {
            return Err(ChainError::FutureTimestamp(block.header.timestamp));
        }

        {
            let included: HashSet<&[u8]> = block.body.blobs.iter().map(Vec::as_slice).collect();
            inner.pending.retain(|blob| !included.contains(blob.as_slice()));
        }

        let chain_cost = block.chain_cost();
        inner.total_work += u128::from(chain_cost);
        inner.index.insert(hash, inner.blocks.len());
        inner.blocks.push(block);

        // Published while the write lock is still held
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        Ok(Accepted {
            hash,
            height: inner.blocks.len() as u64,
            chain_cost,
            generation,
        })
    }

    /// Current best block
    pub fn tip(&self) -> Option<Block> {
        self.inner.read().tip().cloned()
    }

    pub fn get_block(&self, hash: &BlockHash) -> Option<Block> {
        let inner = self.inner.read();
        inner.index.get(hash).map(|&i| inner.blocks[i].clone())
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.inner.read().index.contains_key(hash)
    }

    /// Number of accepted blocks
    pub fn height(&self) -> u64 {
        self.inner.read().blocks.len() as u64
    }

    /// Queue a blob for inclusion in the next mined block.
    /// Returns the pending pool size.
    pub fn submit_blob(&self, blob: Vec<u8>) -> Result<usize, ChainError> {
        if blob.len() > MAX_BLOB_SIZE {
            return Err(ChainError::BlobTooLarge(blob.len(), MAX_BLOB_SIZE));
        }

        let mut inner = self.inner.write();
        if inner.pending.len() >= MAX_PENDING_BLOBS {
            return Err(ChainError::PendingPoolFull(inner.pending.len()));
        }
        inner.pending.push(blob);
        Ok(inner.pending.len())
    }

    pub fn stats(&self) -> ChainStats {
        let inner = self.inner.read();
        ChainStats {
            height: inner.blocks.len() as u64,
            tip: inner.tip().map(Block::hash),
            total_work: inner.total_work,
            difficulty: inner.difficulty,
            pending_blobs: inner.pending.len(),
            generation: self.generation(),
        }
    }
}
