//! powgossip CLI Application
//!
//! Runs a node, or talks to a running one over its query channel.

use clap::{Parser, Subcommand};
use powgossip::core::{Block, BlockHash};
use powgossip::network::{
    query_tip, request, Node, NodeConfig, Request, Response, DEFAULT_DIFFICULTY,
    DEFAULT_DISCOVERY_PORT, DEFAULT_PUSH_PORT, DEFAULT_QUERY_PORT,
};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "powgossip")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Proof-of-work block gossip node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node
    Start {
        /// Address to bind all listeners to
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Query channel port
        #[arg(long, default_value_t = DEFAULT_QUERY_PORT)]
        query_port: u16,

        /// Push channel port
        #[arg(long, default_value_t = DEFAULT_PUSH_PORT)]
        push_port: u16,

        /// Discovery (UDP) port
        #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
        discovery_port: u16,

        /// Seconds between heartbeats
        #[arg(long, default_value = "30")]
        heartbeat_interval: f64,

        /// Seconds between reaper passes
        #[arg(long, default_value = "30")]
        reap_interval: f64,

        /// Seconds of silence before a peer is dropped
        #[arg(long, default_value = "90")]
        reap_threshold: f64,

        /// Required block difficulty
        #[arg(short, long, default_value_t = DEFAULT_DIFFICULTY)]
        difficulty: u32,

        /// Heartbeat targets (comma separated), e.g. 255.255.255.255:10029
        #[arg(long, value_delimiter = ',')]
        targets: Option<Vec<SocketAddr>>,

        /// Do not run the miner
        #[arg(long)]
        no_mining: bool,
    },

    /// Print a node's tip as JSON
    Tip {
        /// Query endpoint of the node
        #[arg(default_value = "127.0.0.1:10000")]
        node: SocketAddr,
    },

    /// Print a block by hash as JSON
    Block {
        /// Block hash (hex)
        hash: String,

        /// Query endpoint of the node
        #[arg(short, long, default_value = "127.0.0.1:10000")]
        node: SocketAddr,
    },

    /// Queue a blob for inclusion in a node's next block
    Submit {
        /// Query endpoint of the node
        #[arg(short, long, default_value = "127.0.0.1:10000")]
        node: SocketAddr,

        /// Blob contents
        data: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        match cli.command {
            Commands::Start {
                host,
                query_port,
                push_port,
                discovery_port,
                heartbeat_interval,
                reap_interval,
                reap_threshold,
                difficulty,
                targets,
                no_mining,
            } => {
                let defaults = NodeConfig::default();
                let config = NodeConfig {
                    host,
                    query_port,
                    push_port,
                    discovery_port,
                    heartbeat_interval: Duration::try_from_secs_f64(heartbeat_interval)?,
                    reap_interval: Duration::try_from_secs_f64(reap_interval)?,
                    reap_threshold: Duration::try_from_secs_f64(reap_threshold)?,
                    difficulty,
                    targets: targets.unwrap_or(defaults.targets),
                    mining: !no_mining,
                    ..defaults
                };

                println!(
                    "🌐 Starting node (query {}, push {}, discovery {})...",
                    query_port, push_port, discovery_port
                );

                let node = Node::bind(config).await?.start()?;
                println!("🆔 Node id {:08x}", node.node_id);

                tokio::signal::ctrl_c().await?;
                println!("\n📴 Shutting down node...");
                node.shutdown().await;
            }

            Commands::Tip { node } => match query_tip(node).await? {
                Some(block) => println!("{}", serde_json::to_string_pretty(&block_json(&block))?),
                None => println!("⚠️  {} has no blocks yet", node),
            },

            Commands::Block { hash, node } => {
                let hash = BlockHash::from_hex(&hash)?;
                match request(node, &Request::GetBlock(hash)).await? {
                    Response::Block(block) => {
                        println!("{}", serde_json::to_string_pretty(&block_json(&block))?)
                    }
                    Response::NotFound => println!("⚠️  Block {} not found on {}", hash, node),
                    other => println!("❌ Unexpected response: {:?}", other),
                }
            }

            Commands::Submit { node, data } => {
                match request(node, &Request::SubmitBlob(data.into_bytes())).await? {
                    Response::BlobAccepted { pending } => {
                        println!("✅ Blob queued ({} pending)", pending);
                    }
                    Response::Error(e) => println!("❌ Rejected: {}", e),
                    other => println!("❌ Unexpected response: {:?}", other),
                }
            }
        }

        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

fn block_json(block: &Block) -> serde_json::Value {
    serde_json::json!({
        "hash": block.hash().to_hex(),
        "nonce": block.nonce,
        "entropy": block.header.entropy,
        "timestamp": block.header.timestamp,
        "difficulty": block.header.difficulty,
        "body_hash": hex::encode(&block.header.body_hash),
        "blobs": block.body.blobs.iter().map(hex::encode).collect::<Vec<_>>(),
    })
}
