//! P2P Node implementation
//!
//! The node binds its three endpoints up front, then [`Node::start`] spawns
//! every worker (listeners, discovery, heartbeat, reaper, miner and the
//! mined-block forwarder) against one cancellation token.

use crate::core::ChainState;
use crate::mining::{MinerConfig, MiningEngine, DEFAULT_POLL_INTERVAL};
use crate::network::discovery::{
    DiscoveryConfig, DiscoveryHandler, HeartbeatProtocol, NodeIdentity,
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_REAP_INTERVAL, DEFAULT_REAP_THRESHOLD,
};
use crate::network::peer::PeerTable;
use crate::network::propagation::{Propagation, DEFAULT_GOSSIP_TIMEOUT};
use crate::network::query::QueryResponder;
use crate::network::server::Server;
use rand::rngs::OsRng;
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default query channel port
pub const DEFAULT_QUERY_PORT: u16 = 10000;
/// Default push channel port
pub const DEFAULT_PUSH_PORT: u16 = 9999;
/// Default discovery port
pub const DEFAULT_DISCOVERY_PORT: u16 = 10029;
/// Default mining difficulty
pub const DEFAULT_DIFFICULTY: u32 = 1 << 20;

/// Invalid node configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("heartbeat interval must be positive")]
    ZeroHeartbeatInterval,
    #[error("reap interval must be positive")]
    ZeroReapInterval,
    #[error("reap threshold {threshold:?} must be at least twice the heartbeat interval {heartbeat:?}")]
    ReapThresholdTooShort {
        threshold: Duration,
        heartbeat: Duration,
    },
    #[error("reap interval {interval:?} exceeds reap threshold {threshold:?}")]
    ReapIntervalTooLong {
        interval: Duration,
        threshold: Duration,
    },
}

/// Node startup errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to start miner thread: {0}")]
    Spawn(std::io::Error),
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address all three listeners bind to
    pub host: IpAddr,
    pub query_port: u16,
    pub push_port: u16,
    pub discovery_port: u16,
    pub heartbeat_interval: Duration,
    pub reap_interval: Duration,
    pub reap_threshold: Duration,
    /// Difficulty required of every block and used for mining
    pub difficulty: u32,
    /// Broadcast or seed endpoints that receive every heartbeat
    pub targets: Vec<SocketAddr>,
    /// Run the mining worker
    pub mining: bool,
    /// Hashes between preemption checks
    pub poll_interval: u32,
    pub gossip_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            query_port: DEFAULT_QUERY_PORT,
            push_port: DEFAULT_PUSH_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reap_interval: DEFAULT_REAP_INTERVAL,
            reap_threshold: DEFAULT_REAP_THRESHOLD,
            difficulty: DEFAULT_DIFFICULTY,
            targets: vec![SocketAddr::from((Ipv4Addr::BROADCAST, DEFAULT_DISCOVERY_PORT))],
            mining: true,
            poll_interval: DEFAULT_POLL_INTERVAL,
            gossip_timeout: DEFAULT_GOSSIP_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Check the liveness timing invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::ZeroReapInterval);
        }
        if self.reap_threshold < self.heartbeat_interval * 2 {
            return Err(ConfigError::ReapThresholdTooShort {
                threshold: self.reap_threshold,
                heartbeat: self.heartbeat_interval,
            });
        }
        if self.reap_interval > self.reap_threshold {
            return Err(ConfigError::ReapIntervalTooLong {
                interval: self.reap_interval,
                threshold: self.reap_threshold,
            });
        }
        Ok(())
    }

    fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            heartbeat_interval: self.heartbeat_interval,
            reap_interval: self.reap_interval,
            reap_threshold: self.reap_threshold,
            targets: self.targets.clone(),
        }
    }
}

/// A node with all endpoints bound but no workers running
pub struct Node {
    config: NodeConfig,
    node_id: u32,
    chain: Arc<ChainState>,
    peers: Arc<PeerTable>,
    query: Server,
    push: Server,
    discovery: Arc<UdpSocket>,
}

impl Node {
    /// Validate the configuration, pick a node id and bind every endpoint.
    /// Port 0 binds an ephemeral port.
    pub async fn bind(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;

        let query_addr = SocketAddr::new(config.host, config.query_port);
        let query = Server::bind("query", query_addr)
            .await
            .map_err(|source| NodeError::Bind {
                listener: "query",
                addr: query_addr,
                source,
            })?;

        let push_addr = SocketAddr::new(config.host, config.push_port);
        let push = Server::bind("push", push_addr)
            .await
            .map_err(|source| NodeError::Bind {
                listener: "push",
                addr: push_addr,
                source,
            })?;

        let discovery_addr = SocketAddr::new(config.host, config.discovery_port);
        let discovery = bind_discovery(discovery_addr)
            .await
            .map_err(|source| NodeError::Bind {
                listener: "discovery",
                addr: discovery_addr,
                source,
            })?;

        let node_id = OsRng.next_u32();
        log::info!(
            "Node {:08x} bound (query {}, push {}, discovery {})",
            node_id,
            query.local_addr(),
            push.local_addr(),
            discovery_addr
        );

        Ok(Self {
            chain: Arc::new(ChainState::new(config.difficulty)),
            peers: Arc::new(PeerTable::new()),
            config,
            node_id,
            query,
            push,
            discovery: Arc::new(discovery),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn chain(&self) -> Arc<ChainState> {
        self.chain.clone()
    }

    pub fn peers(&self) -> Arc<PeerTable> {
        self.peers.clone()
    }

    /// Spawn every worker. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<NodeHandle, NodeError> {
        let shutdown = CancellationToken::new();
        let identity = NodeIdentity {
            node_id: self.node_id,
            push_port: self.push.port(),
            query_port: self.query.port(),
        };

        let query_addr = self.query.local_addr();
        let push_addr = self.push.local_addr();
        let discovery_addr = self
            .discovery
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(self.config.host, self.config.discovery_port));

        let propagation = Arc::new(Propagation::new(
            self.chain.clone(),
            self.peers.clone(),
            self.node_id,
            self.config.gossip_timeout,
        ));
        let responder = Arc::new(QueryResponder::new(self.chain.clone()));
        let handler = Arc::new(DiscoveryHandler::new(
            self.discovery.clone(),
            self.peers.clone(),
            identity,
        ));
        let heartbeat = Arc::new(HeartbeatProtocol::new(
            self.discovery.clone(),
            self.peers.clone(),
            identity,
            self.config.discovery(),
        ));

        // Miner first so nothing it publishes is missed
        let miner = if self.config.mining {
            let engine = MiningEngine::new(
                self.chain.clone(),
                MinerConfig {
                    poll_interval: self.config.poll_interval,
                },
            );
            let events = engine.subscribe();
            let thread = engine
                .spawn(shutdown.clone())
                .map_err(NodeError::Spawn)?;
            Some((thread, events))
        } else {
            None
        };

        let mut tasks = Vec::new();

        let push_propagation = propagation.clone();
        tasks.push(tokio::spawn(self.push.serve(
            shutdown.clone(),
            move |stream, addr, token| push_propagation.clone().handle_connection(stream, addr, token),
        )));

        tasks.push(tokio::spawn(self.query.serve(
            shutdown.clone(),
            move |stream, addr, token| responder.clone().handle_connection(stream, addr, token),
        )));

        tasks.push(tokio::spawn(handler.run(shutdown.clone())));
        tasks.push(tokio::spawn(heartbeat.clone().run_heartbeat(shutdown.clone())));
        tasks.push(tokio::spawn(heartbeat.run_reaper(shutdown.clone())));

        let miner_thread = match miner {
            Some((thread, mut events)) => {
                let propagation = propagation.clone();
                let token = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            event = events.recv() => match event {
                                Ok(mined) => {
                                    let forwarded = propagation.announce_mined(mined.block);
                                    log::info!(
                                        "Announced mined block {} at height {} to {} peers",
                                        mined.hash,
                                        mined.height,
                                        forwarded
                                    );
                                }
                                Err(RecvError::Lagged(missed)) => {
                                    log::warn!("Mined-block forwarder missed {} events", missed);
                                }
                                Err(RecvError::Closed) => break,
                            },
                        }
                    }
                }));
                Some(thread)
            }
            None => None,
        };

        log::info!("Node {:08x} started", self.node_id);

        Ok(NodeHandle {
            node_id: self.node_id,
            query_addr,
            push_addr,
            discovery_addr,
            chain: self.chain,
            peers: self.peers,
            propagation,
            shutdown,
            tasks,
            miner: miner_thread,
        })
    }
}

async fn bind_discovery(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr).await?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

/// A running node
pub struct NodeHandle {
    pub node_id: u32,
    pub query_addr: SocketAddr,
    pub push_addr: SocketAddr,
    pub discovery_addr: SocketAddr,
    chain: Arc<ChainState>,
    peers: Arc<PeerTable>,
    propagation: Arc<Propagation>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    miner: Option<std::thread::JoinHandle<()>>,
}

impl NodeHandle {
    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn propagation(&self) -> &Arc<Propagation> {
        &self.propagation
    }

    /// Stop every worker and wait for them to finish
    pub async fn shutdown(self) {
        log::info!("Node {:08x} shutting down...", self.node_id);
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!("Worker task failed: {}", e);
            }
        }

        if let Some(miner) = self.miner {
            let joined = tokio::task::spawn_blocking(move || miner.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                log::warn!("Miner thread did not exit cleanly");
            }
        }

        let stats = self.chain.stats();
        log::info!(
            "Node {:08x} stopped at height {} (total work {}, {} pending blobs)",
            self.node_id,
            stats.height,
            stats.total_work,
            stats.pending_blobs
        );
    }
}
