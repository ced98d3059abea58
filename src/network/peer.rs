//! Peer table for heartbeat discovery
//!
//! Tracks every node heard from recently, keyed by node id. All mutation goes
//! through [`PeerTable::upsert`] and [`PeerTable::reap`]; both take the single
//! write lock for their whole duration, so a reap pass never observes a
//! half-applied upsert and never removes from a map that is being iterated
//! elsewhere. Readers get owned snapshots.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// A known peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEntry {
    pub node_id: u32,
    /// Source address of the peer's heartbeats (its discovery endpoint)
    pub address: SocketAddr,
    pub push_port: u16,
    pub query_port: u16,
    /// Local arrival time of the latest heartbeat, seconds since epoch
    pub last_seen: f64,
}

impl PeerEntry {
    /// Endpoint of the peer's push/gossip channel
    pub fn push_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.push_port)
    }

    /// Endpoint of the peer's query channel
    pub fn query_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.query_port)
    }

    /// Whether the entry has gone stale at `now`
    pub fn is_stale(&self, now: f64, threshold: Duration) -> bool {
        now - self.last_seen >= threshold.as_secs_f64()
    }
}

/// Outcome of an upsert
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    /// First heartbeat from this node id
    Inserted,
    /// Known peer refreshed
    Refreshed,
    /// Node id now announced from a different address
    Readdressed { previous: SocketAddr },
}

/// Shared set of known peers
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<u32, PeerEntry>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. `last_seen` never moves backwards.
    pub fn upsert(&self, entry: PeerEntry) -> Upsert {
        let mut peers = self.peers.write();
        match peers.get_mut(&entry.node_id) {
            Some(existing) => {
                let previous = existing.address;
                existing.address = entry.address;
                existing.push_port = entry.push_port;
                existing.query_port = entry.query_port;
                existing.last_seen = existing.last_seen.max(entry.last_seen);

                if previous != entry.address {
                    Upsert::Readdressed { previous }
                } else {
                    Upsert::Refreshed
                }
            }
            None => {
                peers.insert(entry.node_id, entry);
                Upsert::Inserted
            }
        }
    }

    /// Remove every entry with `now - last_seen >= threshold`.
    /// Returns the removed entries.
    pub fn reap(&self, now: f64, threshold: Duration) -> Vec<PeerEntry> {
        let mut peers = self.peers.write();
        let stale: Vec<u32> = peers
            .values()
            .filter(|p| p.is_stale(now, threshold))
            .map(|p| p.node_id)
            .collect();

        stale.iter().filter_map(|id| peers.remove(id)).collect()
    }

    /// Copy of all entries
    pub fn snapshot(&self) -> Vec<PeerEntry> {
        self.peers.read().values().cloned().collect()
    }

    pub fn get(&self, node_id: u32) -> Option<PeerEntry> {
        self.peers.read().get(&node_id).cloned()
    }

    pub fn contains(&self, node_id: u32) -> bool {
        self.peers.read().contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }
}
