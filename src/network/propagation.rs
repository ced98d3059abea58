//! Block propagation over the push channel
//!
//! Inbound: every frame on a push connection is a [`Block`]. Valid blocks are
//! handed to the [`ChainState`] and, once accepted, gossiped to every known
//! peer. A shared [`SeenBlocks`] set keyed by block id stops a block from
//! being processed or forwarded twice, which is what ends gossip loops.
//!
//! Outbound: each gossip send is a short-lived connection carrying one frame.

use crate::core::{Block, BlockError, BlockHash, ChainError, ChainState};
use crate::network::framing::{receive_framed_segment, FrameCodec};
use crate::network::peer::PeerTable;
use crate::network::NetworkError;
use bytes::Bytes;
use futures::SinkExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Default connect + write timeout for one gossip send
pub const DEFAULT_GOSSIP_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Seen Blocks
// =============================================================================

/// Append-only set of block ids already processed or forwarded
#[derive(Debug, Default)]
pub struct SeenBlocks {
    seen: Mutex<HashSet<BlockHash>>,
}

impl SeenBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a block id. Returns `false` if it was already present.
    pub fn insert(&self, hash: BlockHash) -> bool {
        self.seen.lock().insert(hash)
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.seen.lock().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

// =============================================================================
// Push Receiver
// =============================================================================

/// What happened to a pushed payload
#[derive(Debug)]
pub enum PushOutcome {
    /// Accepted as the new tip and gossiped to this many peers
    Accepted { hash: BlockHash, forwarded: usize },
    /// Already seen, dropped without forwarding
    Duplicate(BlockHash),
    /// Payload did not decode as a block
    Malformed(BlockError),
    /// Failed block validation
    Invalid(BlockHash, BlockError),
    /// Valid but refused by the chain
    Rejected(BlockHash, ChainError),
}

/// Push receiver and gossip sender
pub struct Propagation {
    chain: Arc<ChainState>,
    peers: Arc<PeerTable>,
    seen: SeenBlocks,
    node_id: u32,
    gossip_timeout: Duration,
}

impl Propagation {
    pub fn new(
        chain: Arc<ChainState>,
        peers: Arc<PeerTable>,
        node_id: u32,
        gossip_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            peers,
            seen: SeenBlocks::new(),
            node_id,
            gossip_timeout,
        }
    }

    pub fn seen(&self) -> &SeenBlocks {
        &self.seen
    }

    /// Process one pushed payload
    pub fn handle_pushed(&self, payload: &[u8], from: SocketAddr) -> PushOutcome {
        let block = match Block::from_bytes(payload) {
            Ok(block) => block,
            Err(e) => {
                warn!("Undecodable block from {}: {}", from, e);
                return PushOutcome::Malformed(e);
            }
        };

        let hash = block.hash();
        if self.seen.contains(&hash) {
            debug!("Already seen block {} from {}", hash, from);
            return PushOutcome::Duplicate(hash);
        }

        if let Err(e) = block.validate() {
            warn!("Rejected invalid block {} from {}: {}", hash, from, e);
            return PushOutcome::Invalid(hash, e);
        }

        // Another connection may have raced us past the check above
        if !self.seen.insert(hash) {
            return PushOutcome::Duplicate(hash);
        }

        match self.chain.accept_validated(block.clone()) {
            Ok(accepted) => {
                info!(
                    "Accepted block {} from {} at height {}",
                    hash, from, accepted.height
                );
                let forwarded = self.gossip(block);
                PushOutcome::Accepted { hash, forwarded }
            }
            Err(e) => {
                info!("Chain refused block {} from {}: {}", hash, from, e);
                PushOutcome::Rejected(hash, e)
            }
        }
    }

    /// Gossip a locally mined block. Returns the number of peers targeted,
    /// or zero if the block had already been seen.
    pub fn announce_mined(&self, block: Block) -> usize {
        if !self.seen.insert(block.hash()) {
            return 0;
        }
        self.gossip(block)
    }

    /// Forward a block to every known peer except ourselves.
    /// Sends run in the background; returns the number of peers targeted.
    fn gossip(&self, block: Block) -> usize {
        let payload = match block.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!("Failed to encode block for gossip: {}", e);
                return 0;
            }
        };

        let hash = block.hash();
        let targets: Vec<SocketAddr> = self
            .peers
            .snapshot()
            .into_iter()
            .filter(|p| p.node_id != self.node_id)
            .map(|p| p.push_addr())
            .collect();

        for addr in &targets {
            let addr = *addr;
            let payload = payload.clone();
            let timeout = self.gossip_timeout;
            tokio::spawn(async move {
                match time::timeout(timeout, send_frame(addr, payload)).await {
                    Ok(Ok(())) => debug!("Gossiped block {} to {}", hash, addr),
                    Ok(Err(e)) => debug!("Gossip of {} to {} failed: {}", hash, addr, e),
                    Err(_) => debug!("Gossip of {} to {} timed out", hash, addr),
                }
            });
        }

        targets.len()
    }

    /// Service one push connection until the peer closes it, a framing error
    /// occurs, or `shutdown` fires.
    pub async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) {
        let mut frames = Framed::new(stream, FrameCodec::new());
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                frame = receive_framed_segment(&mut frames) => match frame {
                    Ok(Some(payload)) => {
                        self.handle_pushed(&payload, addr);
                    }
                    Ok(None) => {
                        debug!("Push peer {} disconnected", addr);
                        break;
                    }
                    Err(e) => {
                        warn!("Framing error from {}: {}", addr, e);
                        break;
                    }
                },
            }
        }
    }
}

// =============================================================================
// Client
// =============================================================================

async fn send_frame(addr: SocketAddr, payload: Bytes) -> Result<(), NetworkError> {
    let stream = TcpStream::connect(addr).await?;
    let mut frames = Framed::new(stream, FrameCodec::new());
    frames.send(payload).await?;
    frames.close().await?;
    Ok(())
}

/// Push one block to a node's push channel
pub async fn push_block(addr: SocketAddr, block: &Block) -> Result<(), NetworkError> {
    send_frame(addr, Bytes::from(block.to_bytes()?)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::tests::mine_test_block;
    use crate::core::now_timestamp;
    use crate::network::peer::PeerEntry;
    use tokio::net::TcpListener;

    fn from() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn propagation(node_id: u32) -> Arc<Propagation> {
        Arc::new(Propagation::new(
            Arc::new(ChainState::new(1)),
            Arc::new(PeerTable::new()),
            node_id,
            Duration::from_secs(1),
        ))
    }

    fn add_peer(p: &Propagation, node_id: u32, push_port: u16) {
        p.peers.upsert(PeerEntry {
            node_id,
            address: SocketAddr::from(([127, 0, 0, 1], 10029)),
            push_port,
            query_port: 0,
            last_seen: now_timestamp(),
        });
    }

    #[test]
    fn test_seen_blocks_insert_reports_presence() {
        let seen = SeenBlocks::new();
        let hash = mine_test_block(vec![], 1, 1.0).hash();
        assert!(seen.insert(hash));
        assert!(!seen.insert(hash));
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let p = propagation(1);
        assert!(matches!(
            p.handle_pushed(b"not a block", from()),
            PushOutcome::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_block_not_recorded() {
        let p = propagation(1);
        let mut block = mine_test_block(vec![b"real".to_vec()], 1, now_timestamp());
        block.body.blobs[0] = b"fake".to_vec();

        let outcome = p.handle_pushed(&block.to_bytes().unwrap(), from());
        assert!(matches!(
            outcome,
            PushOutcome::Invalid(_, BlockError::BodyHashMismatch)
        ));
        assert!(p.seen.is_empty());
        assert!(p.chain.tip().is_none());
    }

    #[tokio::test]
    async fn test_valid_block_accepted_once() {
        let p = propagation(1);
        let block = mine_test_block(vec![b"tx".to_vec()], 1, now_timestamp());
        let bytes = block.to_bytes().unwrap();

        assert!(matches!(
            p.handle_pushed(&bytes, from()),
            PushOutcome::Accepted { forwarded: 0, .. }
        ));
        assert_eq!(p.chain.tip(), Some(block));
        assert!(matches!(
            p.handle_pushed(&bytes, from()),
            PushOutcome::Duplicate(_)
        ));
    }

    #[tokio::test]
    async fn test_chain_rejection_surfaces() {
        let p = Arc::new(Propagation::new(
            Arc::new(ChainState::new(8)),
            Arc::new(PeerTable::new()),
            1,
            Duration::from_secs(1),
        ));
        let block = mine_test_block(vec![], 2, now_timestamp());
        assert!(matches!(
            p.handle_pushed(&block.to_bytes().unwrap(), from()),
            PushOutcome::Rejected(_, ChainError::InsufficientDifficulty { .. })
        ));
    }

    #[tokio::test]
    async fn test_gossip_skips_self() {
        let p = propagation(1);
        add_peer(&p, 1, 1);
        let block = mine_test_block(vec![], 1, now_timestamp());
        assert_eq!(p.announce_mined(block.clone()), 0);
        // Announcing the same block again is a no-op
        assert_eq!(p.announce_mined(block), 0);
    }

    /// Accepts one connection and returns the frames it carried
    async fn capture_frames(listener: TcpListener) -> Vec<Vec<u8>> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = Framed::new(stream, FrameCodec::new());
        let mut out = Vec::new();
        while let Some(frame) = receive_framed_segment(&mut frames).await.unwrap() {
            out.push(frame.to_vec());
        }
        out
    }

    #[tokio::test]
    async fn test_gossip_loop_is_cut() {
        // A forwards to B; B sends the same block back to A
        let b_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_port = b_listener.local_addr().unwrap().port();
        let captured = tokio::spawn(capture_frames(b_listener));

        let a = propagation(0xA);
        add_peer(&a, 0xB, b_port);

        let block = mine_test_block(vec![b"loop".to_vec()], 1, now_timestamp());
        let bytes = block.to_bytes().unwrap();

        assert!(matches!(
            a.handle_pushed(&bytes, from()),
            PushOutcome::Accepted { forwarded: 1, .. }
        ));
        let frames = time::timeout(Duration::from_secs(5), captured)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frames, vec![bytes.clone()]);

        // The echo from B is dropped and not forwarded again
        assert!(matches!(
            a.handle_pushed(&bytes, from()),
            PushOutcome::Duplicate(_)
        ));
        assert_eq!(a.chain.height(), 1);
    }

    #[tokio::test]
    async fn test_non_finite_timestamp_not_forwarded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = listener.local_addr().unwrap().port();

        let p = propagation(1);
        add_peer(&p, 2, peer_port);
        let tip = mine_test_block(vec![], 1, now_timestamp());
        p.chain.accept_block(tip.clone()).unwrap();

        for timestamp in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let block = mine_test_block(vec![b"bad".to_vec()], 1, timestamp);
            assert!(matches!(
                p.handle_pushed(&block.to_bytes().unwrap(), from()),
                PushOutcome::Invalid(_, BlockError::NonFiniteTimestamp(_))
            ));
        }

        assert!(p.seen.is_empty());
        assert_eq!(p.chain.tip(), Some(tip));
        // Nothing was gossiped to the peer
        assert!(time::timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connection_serviced_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let p = propagation(1);

        let server = {
            let p = p.clone();
            tokio::spawn(async move {
                let (stream, peer) = listener.accept().await.unwrap();
                p.handle_connection(stream, peer, CancellationToken::new()).await;
            })
        };

        let t = now_timestamp();
        let first = mine_test_block(vec![b"1".to_vec()], 1, t);
        let second = mine_test_block(vec![b"2".to_vec()], 1, t + 1.0);

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut frames = Framed::new(stream, FrameCodec::new());
        frames.send(Bytes::from(first.to_bytes().unwrap())).await.unwrap();
        frames.send(Bytes::from_static(b"junk")).await.unwrap();
        frames.send(Bytes::from(second.to_bytes().unwrap())).await.unwrap();
        frames.close().await.unwrap();

        time::timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
        assert_eq!(p.chain.height(), 2);
        assert_eq!(p.chain.tip(), Some(second));
    }

    #[tokio::test]
    async fn test_push_block_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = tokio::spawn(capture_frames(listener));

        let block = mine_test_block(vec![], 1, 5.0);
        push_block(addr, &block).await.unwrap();

        let frames = captured.await.unwrap();
        assert_eq!(Block::from_bytes(&frames[0]).unwrap(), block);
    }
}
