//! Archivas node
//!
//! Main entry point: opens the chain, joins the P2P network, catches up over
//! HTTP and serves the RPC API.

use archivas_core::config::{parse_csv, ConfigError, GenesisDoc, NetworkProfile, NodeConfig};
use archivas_core::constants::NODE_VERSION;
use archivas_core::ibd::{IbdConfig, IbdManager};
use archivas_core::node::Node;
use archivas_core::p2p::{Network, NetworkConfig, NodeAdapter, PeerStore};
use archivas_core::pospace::QMAX;
use archivas_core::rpc::{start_rpc_server, RpcState};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "archivas-node", version = NODE_VERSION, about = "Archivas Proof-of-Space-and-Time node")]
struct Cli {
    /// RPC listen address
    #[arg(long, default_value = "127.0.0.1:8080")]
    rpc: SocketAddr,

    /// P2P listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    p2p: SocketAddr,

    /// Comma-separated peer addresses to dial
    #[arg(long, default_value = "")]
    peer: String,

    /// Database directory
    #[arg(long, default_value = "./data")]
    db: PathBuf,

    /// Require timelord VDF updates before accepting blocks
    #[arg(long)]
    vdf_required: bool,

    /// Network profile (devnet, betanet)
    #[arg(long, default_value = "devnet")]
    network: String,

    /// Genesis JSON; the embedded devnet genesis is used when omitted
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Comma-separated HTTP base URLs for initial block download
    #[arg(long, default_value = "")]
    ibd_peer: String,

    /// Concurrent range requests served to peers
    #[arg(long, default_value_t = 4)]
    ibd_max_concurrent: usize,

    /// Run without the P2P layer
    #[arg(long)]
    no_p2p: bool,

    /// Name advertised in handshakes
    #[arg(long, default_value = "archivas-node")]
    node_name: String,
}

impl Cli {
    fn into_config(self) -> Result<NodeConfig, ConfigError> {
        let network = NetworkProfile::get(&self.network)?;
        let genesis = match &self.genesis {
            Some(path) => GenesisDoc::load(path)?,
            None => GenesisDoc::devnet(),
        };
        let mut config = NodeConfig::devnet(self.db);
        config.consensus = network.consensus_params(genesis.initial_difficulty);
        config.network = network;
        config.genesis = genesis;
        config.rpc_addr = self.rpc;
        config.p2p_addr = self.p2p;
        config.peers = parse_csv(&self.peer);
        config.vdf_required = self.vdf_required;
        config.ibd_peers = parse_csv(&self.ibd_peer);
        config.ibd_max_concurrent = self.ibd_max_concurrent;
        config.enable_p2p = !self.no_p2p;
        config.node_name = self.node_name;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("archivas_core=info,archivas_node=info")),
        )
        .init();

    if let Err(e) = run(Cli::parse()).await {
        error!("node failed to start: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.into_config()?;

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║                 ARCHIVAS NODE {:<27}║", NODE_VERSION);
    println!("║             Proof-of-Space-and-Time chain                ║");
    println!("╚══════════════════════════════════════════════════════════╝");
    info!("QUALITY DOMAIN qmax={} scale=SHA256→uint64", QMAX);
    info!(
        "network={} chain_id={} network_id={} protocol={} db={}",
        config.network.name,
        config.network.chain_id,
        config.network.network_id,
        config.network.protocol_version,
        config.db_path.display()
    );

    let node = Arc::new(Node::open(config.clone())?);
    let tip = node.tip();
    info!(
        "genesis={} tip height={} hash={} difficulty={}",
        node.genesis_hash(),
        tip.height,
        tip.hash,
        tip.difficulty
    );

    let network = if config.enable_p2p {
        let store = PeerStore::new(node.db().clone(), config.network.network_id);
        let net = Network::new(
            NetworkConfig::from_node_config(&config),
            Arc::new(NodeAdapter(node.clone())),
            node.metrics().clone(),
            Some(store),
        );
        net.start().await?;
        node.set_broadcaster(Arc::new(net.clone()));
        Some(net)
    } else {
        info!("[p2p] disabled");
        None
    };

    let watchdog = node.watchdog().clone().spawn();

    if !config.ibd_peers.is_empty() {
        let ibd = IbdManager::new(IbdConfig::new(&config.db_path), node.clone())?;
        let peers = config.ibd_peers.clone();
        tokio::spawn(async move {
            if let Err(e) = ibd.run_with_peers(&peers).await {
                warn!("[ibd] {}; continuing on gossip", e);
            }
        });
    }

    let rpc = tokio::spawn(start_rpc_server(RpcState::new(node.clone(), network), config.rpc_addr));

    tokio::select! {
        res = rpc => match res {
            Ok(Err(e)) => error!("[rpc] server stopped: {}", e),
            Err(e) => error!("[rpc] server task failed: {}", e),
            Ok(Ok(())) => {}
        },
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    watchdog.abort();
    node.close()?;
    info!("database closed at height {}", node.height());
    Ok(())
}
