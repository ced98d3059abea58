//! P2P Networking module
//!
//! Three endpoints per node:
//! - TCP query channel: framed request/response
//! - TCP push channel: framed blocks, re-gossiped on acceptance
//! - UDP discovery channel: heartbeats feeding the peer table

pub mod discovery;
pub mod framing;
pub mod message;
pub mod node;
pub mod peer;
pub mod propagation;
pub mod query;
pub mod server;

pub use discovery::{
    DiscoveryConfig, DiscoveryHandler, HeartbeatProtocol, NodeIdentity,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REAP_INTERVAL, DEFAULT_REAP_THRESHOLD,
};
pub use framing::{
    encode_frame, receive_framed_segment, FrameCodec, FramingError, FRAME_HEADER_LEN, MAGIC,
    MAX_FRAME_SIZE,
};
pub use message::{Heartbeat, Request, Response, MAX_DATAGRAM_SIZE};
pub use node::{
    ConfigError, Node, NodeConfig, NodeError, NodeHandle, DEFAULT_DIFFICULTY,
    DEFAULT_DISCOVERY_PORT, DEFAULT_PUSH_PORT, DEFAULT_QUERY_PORT,
};
pub use peer::{PeerEntry, PeerTable, Upsert};
pub use propagation::{push_block, Propagation, PushOutcome, SeenBlocks, DEFAULT_GOSSIP_TIMEOUT};
pub use query::{query_tip, request, QueryResponder};
pub use server::{NetworkError, Server};
