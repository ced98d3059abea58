//! Cryptographic utilities for the node
//!
//! This module provides:
//! - SHA-256 hashing
//! - The proof-of-work target law

pub mod hash;

pub use hash::{double_sha256, meets_target, pow_target, sha256, work_for_difficulty};
