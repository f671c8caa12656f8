//! Genesis document and block 0

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::ConfigError;
use crate::consensus::{genesis_challenge, Block};
use crate::constants::{BLOCK_GAS_LIMIT, DECIMALS, DENOM_SYMBOL, DIFFICULTY_PARAMS_ID};
use crate::crypto::{sha256, Address, Hash};
use crate::ledger::{empty_root, state_root, WorldState};

/// One genesis balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAlloc {
    pub address: String,
    /// Base units
    pub amount: u64,
}

/// Chain genesis document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisDoc {
    pub chain_name: String,
    #[serde(rename = "chainID")]
    pub chain_id: u64,
    pub denom: String,
    pub decimals: u8,
    pub timestamp: i64,
    pub seed: String,
    #[serde(rename = "networkID")]
    pub network_id: String,
    pub protocol_version: String,
    #[serde(rename = "difficultyParamsID")]
    pub difficulty_params_id: String,
    pub initial_difficulty: u64,
    pub allocations: Vec<GenesisAlloc>,
}

impl GenesisDoc {
    /// Embedded devnet genesis
    pub fn devnet() -> Self {
        Self {
            chain_name: "Archivas Devnet".to_string(),
            chain_id: 1616,
            denom: DENOM_SYMBOL.to_string(),
            decimals: DECIMALS,
            timestamp: 1_730_000_000,
            seed: "archivas-devnet-v4".to_string(),
            network_id: "archivas-devnet-v4".to_string(),
            protocol_version: crate::constants::NODE_VERSION.to_string(),
            difficulty_params_id: DIFFICULTY_PARAMS_ID.to_string(),
            initial_difficulty: 1u64 << 50,
            allocations: vec![GenesisAlloc {
                address: "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf".to_string(),
                amount: 1_000_000_000 * 100_000_000,
            }],
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|e| ConfigError::Genesis(format!(
            "failed to read {}: {}",
            path.display(),
            e
        )))?;
        serde_json::from_slice(&data)
            .map_err(|e| ConfigError::Genesis(format!("failed to parse genesis JSON: {}", e)))
    }

    /// SHA-256 of the compact JSON with allocations sorted by address
    pub fn hash(&self) -> Hash {
        let mut canonical = self.clone();
        canonical.allocations.sort_by(|a, b| a.address.cmp(&b.address));
        // serializing plain strings and integers cannot fail
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        sha256(&bytes)
    }

    /// Refuse a document built for another difficulty parameter set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.difficulty_params_id != DIFFICULTY_PARAMS_ID {
            return Err(ConfigError::Genesis(format!(
                "genesis difficulty params mismatch: got {}, expected {}",
                self.difficulty_params_id, DIFFICULTY_PARAMS_ID
            )));
        }
        Ok(())
    }

    /// Parsed allocations, summing duplicates
    pub fn allocations(&self) -> Result<Vec<(Address, i64)>, ConfigError> {
        self.allocations
            .iter()
            .map(|a| {
                let addr = Address::parse(&a.address)
                    .map_err(|e| ConfigError::Genesis(format!("allocation {}: {}", a.address, e)))?;
                let amount = i64::try_from(a.amount)
                    .map_err(|_| ConfigError::Genesis(format!("allocation {} overflows", a.address)))?;
                Ok((addr, amount))
            })
            .collect()
    }

    pub fn world_state(&self) -> Result<WorldState, ConfigError> {
        WorldState::from_allocations(self.allocations()?)
            .map_err(|e| ConfigError::Genesis(e.to_string()))
    }

    /// Block 0 over the allocated world state
    pub fn block(&self, world: &WorldState) -> Block {
        Block {
            height: 0,
            timestamp_unix: self.timestamp,
            prev_hash: Hash::zero(),
            difficulty: self.initial_difficulty,
            challenge: genesis_challenge(),
            proof: None,
            farmer_addr: Address::default(),
            cumulative_work: 0,
            state_root: state_root(world),
            receipts_root: empty_root(),
            gas_used: 0,
            gas_limit: BLOCK_GAS_LIMIT,
            txs: Vec::new(),
            vdf_seed: None,
            vdf_iterations: 0,
            vdf_output: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devnet_genesis_is_valid() {
        let doc = GenesisDoc::devnet();
        assert!(doc.validate().is_ok());
        let world = doc.world_state().unwrap();
        assert_eq!(world.total_balance(), 100_000_000_000_000_000);
        assert_eq!(doc.block(&world).height, 0);
    }

    #[test]
    fn test_hash_ignores_allocation_order() {
        let mut a = GenesisDoc::devnet();
        a.allocations.push(GenesisAlloc { address: format!("0x{}", "11".repeat(20)), amount: 5 });
        let mut b = a.clone();
        b.allocations.reverse();
        assert_eq!(a.hash(), b.hash());
        b.allocations[0].amount += 1;
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(GenesisDoc::devnet()).unwrap();
        assert!(json.get("chainID").is_some());
        assert!(json.get("difficultyParamsID").is_some());
        assert!(json.get("initialDifficulty").is_some());
        let back: GenesisDoc = serde_json::from_value(json).unwrap();
        assert_eq!(back, GenesisDoc::devnet());
    }

    #[test]
    fn test_params_mismatch_rejected() {
        let mut doc = GenesisDoc::devnet();
        doc.difficulty_params_id = "v1".into();
        assert!(doc.validate().is_err());
    }

    #[test]
    fn test_bad_allocation_rejected() {
        let mut doc = GenesisDoc::devnet();
        doc.allocations[0].address = "nonsense".into();
        assert!(doc.world_state().is_err());
    }
}
