//! Mining module for proof-of-work block creation

pub mod events;
pub mod miner;

pub use events::{MinedBlock, MinedEvents, EVENT_CAPACITY};
pub use miner::{MinerConfig, MiningEngine, MiningStats, DEFAULT_POLL_INTERVAL};
