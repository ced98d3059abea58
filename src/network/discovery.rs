//! Heartbeat peer discovery
//!
//! Three workers share one UDP socket and the [`PeerTable`]:
//! - the [`DiscoveryHandler`] decodes inbound heartbeats and upserts peers,
//! - the heartbeat sender announces this node to the configured targets and
//!   to every known peer,
//! - the reaper drops peers that stopped announcing themselves.

use crate::core::now_timestamp;
use crate::network::message::{Heartbeat, MAX_DATAGRAM_SIZE};
use crate::network::peer::{PeerEntry, PeerTable, Upsert};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Constants
// =============================================================================

/// How often to announce ourselves
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often to scan for stale peers
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// How long a peer may stay silent before it is dropped
pub const DEFAULT_REAP_THRESHOLD: Duration = Duration::from_secs(90);

/// Discovery timing and targets
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub heartbeat_interval: Duration,
    pub reap_interval: Duration,
    pub reap_threshold: Duration,
    /// Broadcast or seed endpoints that receive every heartbeat
    pub targets: Vec<SocketAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            reap_threshold: DEFAULT_REAP_THRESHOLD,
            targets: Vec::new(),
        }
    }
}

/// What this node announces about itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Best-effort unique id drawn at startup
    pub node_id: u32,
    pub push_port: u16,
    pub query_port: u16,
}

// =============================================================================
// Discovery Handler
// =============================================================================

/// UDP listener feeding the peer table
pub struct DiscoveryHandler {
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    identity: NodeIdentity,
}

impl DiscoveryHandler {
    pub fn new(socket: Arc<UdpSocket>, peers: Arc<PeerTable>, identity: NodeIdentity) -> Self {
        Self {
            socket,
            peers,
            identity,
        }
    }

    /// Decode one datagram and upsert its sender.
    ///
    /// Malformed datagrams and our own heartbeats are dropped.
    pub fn handle_datagram(&self, data: &[u8], from: SocketAddr, now: f64) -> Option<Upsert> {
        let heartbeat = match Heartbeat::from_bytes(data) {
            Ok(hb) => hb,
            Err(e) => {
                warn!("Dropping malformed heartbeat from {}: {}", from, e);
                return None;
            }
        };

        if heartbeat.node_id == self.identity.node_id {
            debug!("Ignoring own heartbeat echoed from {}", from);
            return None;
        }

        let outcome = self.peers.upsert(PeerEntry {
            node_id: heartbeat.node_id,
            address: from,
            push_port: heartbeat.push_port,
            query_port: heartbeat.query_port,
            last_seen: now,
        });

        match &outcome {
            Upsert::Inserted => info!("Discovered peer {:08x} at {}", heartbeat.node_id, from),
            Upsert::Refreshed => debug!(
                "Heartbeat from {:08x} at {} (sent at {:.3})",
                heartbeat.node_id, from, heartbeat.timestamp
            ),
            Upsert::Readdressed { previous } => warn!(
                "Node id {:08x} moved from {} to {}; ids are only best-effort unique",
                heartbeat.node_id, previous, from
            ),
        }

        Some(outcome)
    }

    /// Receive heartbeats until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => {
                        self.handle_datagram(&buf[..len], from, now_timestamp());
                    }
                    Err(e) => warn!("Discovery receive error: {}", e),
                },
            }
        }
        debug!("Discovery listener stopped");
    }
}

// =============================================================================
// Heartbeat Protocol
// =============================================================================

/// Heartbeat sender and stale-peer reaper
pub struct HeartbeatProtocol {
    socket: Arc<UdpSocket>,
    peers: Arc<PeerTable>,
    identity: NodeIdentity,
    config: DiscoveryConfig,
}

impl HeartbeatProtocol {
    pub fn new(
        socket: Arc<UdpSocket>,
        peers: Arc<PeerTable>,
        identity: NodeIdentity,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            socket,
            peers,
            identity,
            config,
        }
    }

    /// Build this node's heartbeat
    pub fn heartbeat(&self, now: f64) -> Heartbeat {
        Heartbeat {
            node_id: self.identity.node_id,
            timestamp: now,
            push_port: self.identity.push_port,
            query_port: self.identity.query_port,
        }
    }

    /// Insert or refresh our own entry through the normal upsert path
    pub fn register_self(&self, now: f64) -> std::io::Result<()> {
        self.peers.upsert(PeerEntry {
            node_id: self.identity.node_id,
            address: self.socket.local_addr()?,
            push_port: self.identity.push_port,
            query_port: self.identity.query_port,
            last_seen: now,
        });
        Ok(())
    }

    /// Endpoints for the next heartbeat: configured targets plus every known
    /// peer except ourselves, without repeats.
    fn heartbeat_targets(&self) -> Vec<SocketAddr> {
        let mut seen = HashSet::new();
        self.config
            .targets
            .iter()
            .copied()
            .chain(
                self.peers
                    .snapshot()
                    .into_iter()
                    .filter(|p| p.node_id != self.identity.node_id)
                    .map(|p| p.address),
            )
            .filter(|addr| seen.insert(*addr))
            .collect()
    }

    /// Send one heartbeat round. Returns the number of datagrams sent.
    pub async fn beat(&self) -> usize {
        let now = now_timestamp();
        if let Err(e) = self.register_self(now) {
            warn!("Failed to refresh own peer entry: {}", e);
        }

        let bytes = match self.heartbeat(now).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode heartbeat: {}", e);
                return 0;
            }
        };

        let mut sent = 0;
        for target in self.heartbeat_targets() {
            match self.socket.send_to(&bytes, target).await {
                Ok(_) => sent += 1,
                Err(e) => debug!("Heartbeat to {} failed: {}", target, e),
            }
        }
        debug!("Heartbeat sent to {} endpoints", sent);
        sent
    }

    /// One reaper pass at `now`
    pub fn reap_once(&self, now: f64) -> Vec<PeerEntry> {
        let removed = self.peers.reap(now, self.config.reap_threshold);
        for peer in &removed {
            info!("Peer {:08x} at {} is dead", peer.node_id, peer.address);
        }
        removed
    }

    /// Announce ourselves every `heartbeat_interval` until cancelled
    pub async fn run_heartbeat(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }
        debug!("Heartbeat sender stopped");
    }

    /// Reap stale peers every `reap_interval` until cancelled
    pub async fn run_reaper(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.reap_interval;
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.reap_once(now_timestamp());
                }
            }
        }
        debug!("Reaper stopped");
    }
}
