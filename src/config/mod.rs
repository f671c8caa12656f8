//! Node configuration: network profiles, genesis and runtime settings

mod genesis;

pub use genesis::*;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::consensus::ConsensusParams;
use crate::constants::BECH32_HRP;
use crate::vdf::MAX_BLOCK_VDF_ITERATIONS;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown network: {0} (available: devnet, betanet)")]
    UnknownNetwork(String),
    #[error("genesis: {0}")]
    Genesis(String),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Static parameters of one network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkProfile {
    pub name: &'static str,
    pub chain_id: &'static str,
    pub network_id: u64,
    pub protocol_version: u32,
    pub default_seeds: &'static [&'static str],
    pub default_rpc_port: u16,
    pub default_p2p_port: u16,
    pub target_block_secs: u64,
    pub initial_difficulty: u64,
    pub bech32_prefix: &'static str,
}

const DEVNET: NetworkProfile = NetworkProfile {
    name: "devnet",
    chain_id: "archivas-devnet-1",
    network_id: 1,
    protocol_version: 1,
    default_seeds: &[],
    default_rpc_port: 8080,
    default_p2p_port: 9090,
    target_block_secs: 20,
    initial_difficulty: 1u64 << 50,
    bech32_prefix: BECH32_HRP,
};

const BETANET: NetworkProfile = NetworkProfile {
    name: "betanet",
    chain_id: "archivas-betanet-1",
    network_id: 1644,
    protocol_version: 2,
    default_seeds: &["seed1.betanet.archivas.ai:9090", "seed2.betanet.archivas.ai:9090"],
    default_rpc_port: 8545,
    default_p2p_port: 9090,
    target_block_secs: 20,
    initial_difficulty: 15_000_000,
    bech32_prefix: BECH32_HRP,
};

impl NetworkProfile {
    pub fn get(name: &str) -> Result<Self, ConfigError> {
        match name {
            "devnet" => Ok(DEVNET),
            "betanet" => Ok(BETANET),
            other => Err(ConfigError::UnknownNetwork(other.to_string())),
        }
    }

    pub fn devnet() -> Self {
        DEVNET
    }

    /// Consensus parameters for this network, starting at `initial_difficulty`
    pub fn consensus_params(&self, initial_difficulty: u64) -> ConsensusParams {
        ConsensusParams {
            initial_difficulty,
            target_block_secs: self.target_block_secs,
            ..ConsensusParams::default()
        }
    }
}

/// Everything needed to start a node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub rpc_addr: SocketAddr,
    pub p2p_addr: SocketAddr,
    pub peers: Vec<String>,
    pub db_path: PathBuf,
    pub vdf_required: bool,
    /// Largest `vdf_iterations` a block may claim
    pub max_block_vdf_iterations: u64,
    pub network: NetworkProfile,
    pub genesis: GenesisDoc,
    pub consensus: ConsensusParams,
    pub node_name: String,
    pub enable_p2p: bool,
    /// HTTP base URLs used for catch-up before joining gossip
    pub ibd_peers: Vec<String>,
    /// Concurrent range requests served to peers
    pub ibd_max_concurrent: usize,
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
}

impl NodeConfig {
    /// Devnet defaults rooted at `db_path`
    pub fn devnet(db_path: impl Into<PathBuf>) -> Self {
        let network = NetworkProfile::devnet();
        let genesis = GenesisDoc::devnet();
        let consensus = network.consensus_params(genesis.initial_difficulty);
        Self {
            rpc_addr: SocketAddr::from(([127, 0, 0, 1], network.default_rpc_port)),
            p2p_addr: SocketAddr::from(([0, 0, 0, 0], network.default_p2p_port)),
            peers: Vec::new(),
            db_path: db_path.into(),
            vdf_required: false,
            max_block_vdf_iterations: MAX_BLOCK_VDF_ITERATIONS,
            network,
            genesis,
            consensus,
            node_name: "archivas-node".to_string(),
            enable_p2p: true,
            ibd_peers: Vec::new(),
            ibd_max_concurrent: 4,
            ping_interval: Duration::from_secs(15),
            peer_timeout: Duration::from_secs(45),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.genesis.validate()?;
        if self.ibd_max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                name: "ibd_max_concurrent",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_block_vdf_iterations == 0 {
            return Err(ConfigError::Invalid {
                name: "max_block_vdf_iterations",
                reason: "must be positive".into(),
            });
        }
        if self.consensus.min_difficulty == 0 {
            return Err(ConfigError::Invalid {
                name: "min_difficulty",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Split a comma-separated list, dropping blanks
pub fn parse_csv(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
