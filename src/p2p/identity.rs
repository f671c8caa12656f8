//! Chain identity exchanged in the handshake

use serde::{Deserialize, Serialize};

use super::PeerError;
use crate::config::NodeConfig;
use crate::constants::NODE_VERSION;
use crate::crypto::Hash;

/// What makes two nodes members of the same network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainIdentity {
    pub genesis_hash: Hash,
    pub chain_id: String,
    pub network_id: u64,
    pub protocol_version: u32,
    pub difficulty_params_id: String,
}

impl ChainIdentity {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            genesis_hash: config.genesis.hash(),
            chain_id: config.network.chain_id.to_string(),
            network_id: config.network.network_id,
            protocol_version: config.network.protocol_version,
            difficulty_params_id: config.consensus.params_id.clone(),
        }
    }

    /// Handshake payload advertising this identity
    pub fn handshake(&self, node_name: &str) -> Handshake {
        Handshake {
            genesis_hash: self.genesis_hash,
            chain_id: self.chain_id.clone(),
            network_id: self.network_id,
            protocol_version: self.protocol_version,
            node_version: NODE_VERSION.to_string(),
            node_name: node_name.to_string(),
            network_id_legacy: self.network_id.to_string(),
            protocol_version_str: self.protocol_version.to_string(),
            difficulty_params_id: self.difficulty_params_id.clone(),
        }
    }

    /// Strict comparison; the first mismatch decides the reason
    pub fn check(&self, theirs: &Handshake) -> Result<(), PeerError> {
        if theirs.genesis_hash != self.genesis_hash
            || theirs.chain_id != self.chain_id
            || theirs.network_id != self.network_id
        {
            return Err(PeerError::InvalidHandshake("peer is on a different chain".into()));
        }
        if theirs.protocol_version != self.protocol_version {
            return Err(PeerError::InvalidHandshake("protocol version is incompatible".into()));
        }
        if theirs.difficulty_params_id != self.difficulty_params_id {
            return Err(PeerError::InvalidHandshake(format!(
                "difficulty params mismatch: {} vs {}",
                theirs.difficulty_params_id, self.difficulty_params_id
            )));
        }
        Ok(())
    }
}

/// Handshake payload (message type 0)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub genesis_hash: Hash,
    pub chain_id: String,
    pub network_id: u64,
    pub protocol_version: u32,
    pub node_version: String,
    pub node_name: String,
    #[serde(default)]
    pub network_id_legacy: String,
    #[serde(default)]
    pub protocol_version_str: String,
    #[serde(default)]
    pub difficulty_params_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ChainIdentity {
        ChainIdentity::from_config(&NodeConfig::devnet("/tmp/unused"))
    }

    #[test]
    fn test_same_identity_accepted() {
        let id = identity();
        let hs = id.handshake("peer-a");
        assert_eq!(hs.network_id_legacy, "1");
        assert!(id.check(&hs).is_ok());
    }

    #[test]
    fn test_mismatches_rejected() {
        let id = identity();

        let mut hs = id.handshake("x");
        hs.genesis_hash = Hash([9; 32]);
        assert!(matches!(
            id.check(&hs),
            Err(PeerError::InvalidHandshake(r)) if r == "peer is on a different chain"
        ));

        let mut hs = id.handshake("x");
        hs.network_id = 1644;
        assert!(id.check(&hs).is_err());

        let mut hs = id.handshake("x");
        hs.protocol_version = 2;
        assert!(matches!(
            id.check(&hs),
            Err(PeerError::InvalidHandshake(r)) if r == "protocol version is incompatible"
        ));

        let mut hs = id.handshake("x");
        hs.difficulty_params_id = "v1".into();
        assert!(matches!(id.check(&hs), Err(PeerError::InvalidHandshake(_))));
    }
}
