//! powgossip: a proof-of-work block gossip node
//!
//! This crate provides:
//! - Blocks with a double SHA-256 proof-of-work and a shared chain tip
//! - A cancellable mining engine publishing mined blocks to subscribers
//! - Heartbeat discovery over UDP with stale-peer reaping
//! - Framed TCP channels for block push/gossip and tip queries
//!
//! # Example
//!
//! ```rust,no_run
//! use powgossip::network::{query_tip, Node, NodeConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::bind(NodeConfig::default()).await?.start()?;
//! println!("Node {:08x} running", node.node_id);
//!
//! if let Some(tip) = query_tip(node.query_addr).await? {
//!     println!("Tip: {}", tip.hash());
//! }
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod crypto;
pub mod mining;
pub mod network;

// Re-export commonly used types
pub use core::{Block, BlockHash, ChainState};
pub use mining::{MinedBlock, MiningEngine};
pub use network::{Node, NodeConfig, NodeHandle, PeerTable};
