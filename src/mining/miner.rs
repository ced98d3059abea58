//! Mining engine for the node
//!
//! Searches for a nonce satisfying the proof-of-work predicate on a candidate
//! built from the chain's current template. The search polls the chain's tip
//! generation every `poll_interval` hashes and abandons a candidate as soon as
//! the tip moves. Found solutions are committed through
//! [`ChainState::accept_mined`], which discards them if the tip moved in the
//! meantime, and only committed blocks are published.

use crate::core::{
    is_valid_pow, now_timestamp, Block, BlockBody, BlockHeader, ChainError, ChainState,
    MiningTemplate,
};
use crate::mining::events::{MinedBlock, MinedEvents};
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Hashes between preemption checks
pub const DEFAULT_POLL_INTERVAL: u32 = 4096;

/// Smallest timestamp step between a tip and the next candidate
const MIN_TIMESTAMP_STEP: f64 = 1e-6;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    /// Number of hash attempts
    pub hash_attempts: u64,
    /// Time taken in milliseconds
    pub time_ms: u128,
    /// Hash rate (hashes per second)
    pub hash_rate: f64,
}

impl MiningStats {
    fn new(hash_attempts: u64, start: Instant) -> Self {
        let time_ms = start.elapsed().as_millis();
        let hash_rate = if time_ms > 0 {
            (hash_attempts as f64) / (time_ms as f64 / 1000.0)
        } else {
            hash_attempts as f64
        };
        Self {
            hash_attempts,
            time_ms,
            hash_rate,
        }
    }
}

/// Miner configuration
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Hashes between preemption and cancellation checks
    pub poll_interval: u32,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// The block being searched for. Never mutated, replaced on every restart.
#[derive(Debug, Clone)]
struct MiningCandidate {
    generation: u64,
    header: BlockHeader,
    body: BlockBody,
}

impl MiningCandidate {
    fn from_template(template: MiningTemplate) -> Self {
        let mut timestamp = now_timestamp();
        if let Some(tip) = template.tip_timestamp {
            timestamp = timestamp.max(tip + MIN_TIMESTAMP_STEP);
        }

        let header =
            BlockHeader::for_body(&template.body, rand::random(), timestamp, template.difficulty);

        Self {
            generation: template.generation,
            header,
            body: template.body,
        }
    }
}

#[derive(Debug, PartialEq)]
enum SearchOutcome {
    Found { nonce: u32, attempts: u64 },
    Preempted { attempts: u64 },
    Exhausted { attempts: u64 },
    Cancelled,
}

/// Proof-of-work mining engine
pub struct MiningEngine {
    chain: Arc<ChainState>,
    events: MinedEvents,
    config: MinerConfig,
}

impl MiningEngine {
    /// Create a new mining engine
    pub fn new(chain: Arc<ChainState>, config: MinerConfig) -> Self {
        Self {
            chain,
            events: MinedEvents::default(),
            config,
        }
    }

    /// Register a mined-block subscriber. Subscribe before starting the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<MinedBlock> {
        self.events.subscribe()
    }

    /// Mine until one block is committed to the chain.
    ///
    /// Candidates superseded by a new tip are dropped and rebuilt. Returns
    /// `None` only when `shutdown` is cancelled.
    pub fn mine_block(&self, shutdown: &CancellationToken) -> Option<(MinedBlock, MiningStats)> {
        let start = Instant::now();
        let mut total_attempts = 0u64;

        loop {
            let candidate = MiningCandidate::from_template(self.chain.template());
            debug!(
                "Mining candidate on generation {} with difficulty {} ({} blobs)",
                candidate.generation,
                candidate.header.difficulty,
                candidate.body.blobs.len()
            );

            let nonce = match self.search(&candidate, shutdown) {
                SearchOutcome::Found { nonce, attempts } => {
                    total_attempts += attempts;
                    nonce
                }
                SearchOutcome::Preempted { attempts } => {
                    total_attempts += attempts;
                    debug!("Tip moved, abandoning candidate after {} attempts", attempts);
                    continue;
                }
                SearchOutcome::Exhausted { attempts } => {
                    total_attempts += attempts;
                    debug!("Nonce space exhausted, rebuilding candidate");
                    continue;
                }
                SearchOutcome::Cancelled => return None,
            };

            let block = Block::new(nonce, candidate.header, candidate.body);
            match self.chain.accept_mined(block.clone(), candidate.generation) {
                Ok(accepted) => {
                    let stats = MiningStats::new(total_attempts, start);
                    info!(
                        "Block {} mined at height {} in {}ms ({} attempts, {:.2} H/s)",
                        accepted.hash, accepted.height, stats.time_ms, total_attempts, stats.hash_rate
                    );

                    let event = MinedBlock {
                        block,
                        hash: accepted.hash,
                        chain_cost: accepted.chain_cost,
                        height: accepted.height,
                    };
                    self.events.publish(event.clone());
                    return Some((event, stats));
                }
                Err(ChainError::Superseded { built_on, current }) => {
                    debug!(
                        "Discarding solution built on generation {} (tip at {})",
                        built_on, current
                    );
                }
                Err(e) => {
                    warn!("Mined block rejected by chain: {}", e);
                }
            }
        }
    }

    /// Mine blocks until `shutdown` is cancelled
    pub fn run(&self, shutdown: &CancellationToken) {
        info!(
            "Miner started (difficulty {}, poll interval {}, {} subscribers)",
            self.chain.difficulty(),
            self.config.poll_interval,
            self.events.subscriber_count()
        );
        while self.mine_block(shutdown).is_some() {}
        info!("Miner stopped");
    }

    /// Run the engine on a dedicated thread
    pub fn spawn(self, shutdown: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("miner".to_string())
            .spawn(move || self.run(&shutdown))
    }

    fn search(&self, candidate: &MiningCandidate, shutdown: &CancellationToken) -> SearchOutcome {
        let poll_interval = u64::from(self.config.poll_interval.max(1));
        let difficulty = candidate.header.difficulty;
        let mut nonce: u32 = rand::random();

        for attempts in 0..=u64::from(u32::MAX) {
            if attempts % poll_interval == 0 {
                if shutdown.is_cancelled() {
                    return SearchOutcome::Cancelled;
                }
                if self.chain.generation() != candidate.generation {
                    return SearchOutcome::Preempted { attempts };
                }
            }

            if is_valid_pow(&candidate.header, nonce, difficulty) {
                return SearchOutcome::Found {
                    nonce,
                    attempts: attempts + 1,
                };
            }

            nonce = nonce.wrapping_add(1);
        }

        SearchOutcome::Exhausted {
            attempts: u64::from(u32::MAX) + 1,
        }
    }
}
