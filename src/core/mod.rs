//! Core chain components
//!
//! This module contains the fundamental building blocks:
//! - Blocks (header, body, proof-of-work predicate, wire encoding)
//! - Chain state (authoritative tip, pending blobs, tip generation)

pub mod block;
pub mod chain_state;

pub use block::{
    is_valid_pow, now_timestamp, Block, BlockBody, BlockError, BlockHash, BlockHeader,
    BODY_HASH_LEN, MAX_BLOB_SIZE, MAX_BLOCK_BLOBS,
};
pub use chain_state::{
    Accepted, ChainError, ChainState, ChainStats, MiningTemplate, MAX_FUTURE_BLOCK_TIME,
    MAX_PENDING_BLOBS,
};
