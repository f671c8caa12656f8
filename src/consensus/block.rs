//! Block structure and the canonical header hash

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{sha256_concat, Address, Hash};
use crate::ledger::Transaction;
use crate::pospace::Proof;

/// A block: header fields plus transactions
///
/// `txs[0]` is the coinbase for every block above genesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    /// Seconds since Unix epoch
    pub timestamp_unix: i64,
    pub prev_hash: Hash,
    pub difficulty: u64,
    pub challenge: Hash,
    /// Absent only on genesis
    pub proof: Option<Proof>,
    pub farmer_addr: Address,
    #[serde(with = "u128_string")]
    pub cumulative_work: u128,
    pub state_root: Hash,
    pub receipts_root: Hash,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub txs: Vec<Transaction>,
    #[serde(default)]
    pub vdf_seed: Option<Hash>,
    #[serde(default)]
    pub vdf_iterations: u64,
    #[serde(default)]
    pub vdf_output: Option<Hash>,
}

impl Block {
    /// Binary-packed header; absent hashes encode as 32 zero bytes
    pub fn header_bytes(&self) -> Vec<u8> {
        let zero = Hash::zero();
        let proof_digest = self.proof.as_ref().map_or(zero, Proof::digest);

        let mut bytes = Vec::with_capacity(8 * 6 + 16 + 20 + 32 * 9);
        bytes.extend_from_slice(&self.height.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp_unix.to_be_bytes());
        bytes.extend_from_slice(&self.prev_hash.0);
        bytes.extend_from_slice(&self.difficulty.to_be_bytes());
        bytes.extend_from_slice(&self.challenge.0);
        bytes.extend_from_slice(&self.farmer_addr.0);
        bytes.extend_from_slice(&self.cumulative_work.to_be_bytes());
        bytes.extend_from_slice(&self.state_root.0);
        bytes.extend_from_slice(&self.receipts_root.0);
        bytes.extend_from_slice(&self.gas_used.to_be_bytes());
        bytes.extend_from_slice(&self.gas_limit.to_be_bytes());
        bytes.extend_from_slice(&self.tx_root().0);
        bytes.extend_from_slice(&proof_digest.0);
        bytes.extend_from_slice(&self.vdf_seed.unwrap_or(zero).0);
        bytes.extend_from_slice(&self.vdf_iterations.to_be_bytes());
        bytes.extend_from_slice(&self.vdf_output.unwrap_or(zero).0);
        bytes
    }

    /// Block hash: SHA-256 of the packed header
    pub fn hash(&self) -> Hash {
        Hash(Sha256::digest(self.header_bytes()).into())
    }

    /// SHA-256 over the concatenated transaction hashes, zero when empty
    pub fn tx_root(&self) -> Hash {
        if self.txs.is_empty() {
            return Hash::zero();
        }
        let hashes: Vec<Hash> = self.txs.iter().map(Transaction::hash).collect();
        let parts: Vec<&[u8]> = hashes.iter().map(|h| h.as_ref()).collect();
        sha256_concat(&parts)
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.txs.first().filter(|tx| tx.is_coinbase())
    }

    /// Transactions after the coinbase
    pub fn user_txs(&self) -> &[Transaction] {
        match self.coinbase() {
            Some(_) => &self.txs[1..],
            None => &self.txs,
        }
    }
}

/// u128 as a decimal string so JSON values never overflow
mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn sample_block() -> Block {
        Block {
            height: 1,
            timestamp_unix: 1_700_000_000,
            prev_hash: Hash([1; 32]),
            difficulty: 1 << 50,
            challenge: Hash([2; 32]),
            proof: None,
            farmer_addr: Address([3; 20]),
            cumulative_work: 1 << 51,
            state_root: Hash([4; 32]),
            receipts_root: Hash([5; 32]),
            gas_used: 0,
            gas_limit: 30_000_000,
            txs: vec![Transaction::coinbase(Address([3; 20]), 2_000_000_000, 1)],
            vdf_seed: None,
            vdf_iterations: 0,
            vdf_output: None,
        }
    }

    #[test]
    fn test_header_layout_size() {
        let block = sample_block();
        // 6 u64 fields, u128 work, 20-byte address, 9 hashes
        assert_eq!(block.header_bytes().len(), 6 * 8 + 16 + 20 + 9 * 32);
    }

    #[test]
    fn test_hash_commits_to_fields() {
        let block = sample_block();
        let mut other = block.clone();
        other.vdf_iterations = 1;
        assert_ne!(block.hash(), other.hash());

        let mut other = block.clone();
        other.txs.clear();
        assert_ne!(block.hash(), other.hash());
    }

    #[test]
    fn test_json_roundtrip_preserves_hash() {
        let mut block = sample_block();
        block.cumulative_work = u128::MAX;
        let json = serde_json::to_value(&block).unwrap();
        assert!(json["cumulative_work"].is_string());
        let back: Block = serde_json::from_value(json).unwrap();
        assert_eq!(back.hash(), block.hash());
    }

    #[test]
    fn test_coinbase_split() {
        let block = sample_block();
        assert!(block.coinbase().is_some());
        assert!(block.user_txs().is_empty());
    }
}
