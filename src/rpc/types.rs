//! Request and response bodies shared by the server, farmer, timelord and IBD client

use serde::{Deserialize, Serialize};

use crate::consensus::Block;
use crate::crypto::{Address, Hash};
use crate::node::{ChainTip, ChallengeSnapshot};
use crate::pospace::Proof;
use crate::vdf::VdfState;

/// `GET /chainTip`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTipResponse {
    #[serde(with = "u64_string")]
    pub height: u64,
    pub hash: Hash,
    #[serde(rename = "blockHash")]
    pub block_hash: Hash,
    #[serde(with = "u64_string")]
    pub difficulty: u64,
}

impl From<ChainTip> for ChainTipResponse {
    fn from(tip: ChainTip) -> Self {
        Self {
            height: tip.height,
            hash: tip.hash,
            block_hash: tip.hash,
            difficulty: tip.difficulty,
        }
    }
}

/// `GET /challenge`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: Hash,
    pub difficulty: u64,
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vdf: Option<VdfInfo>,
}

impl From<ChallengeSnapshot> for ChallengeResponse {
    fn from(s: ChallengeSnapshot) -> Self {
        Self {
            challenge: s.challenge,
            difficulty: s.difficulty,
            height: s.height,
            vdf: s.vdf.map(VdfInfo::from),
        }
    }
}

/// VDF point as shown on `/challenge`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdfInfo {
    #[serde(rename = "seed_hex", alias = "seed")]
    pub seed: Hash,
    pub iterations: u64,
    #[serde(rename = "output_hex", alias = "output")]
    pub output: Hash,
}

impl From<VdfState> for VdfInfo {
    fn from(v: VdfState) -> Self {
        Self {
            seed: v.seed,
            iterations: v.iterations,
            output: v.output,
        }
    }
}

impl From<VdfInfo> for VdfState {
    fn from(v: VdfInfo) -> Self {
        Self {
            seed: v.seed,
            iterations: v.iterations,
            output: v.output,
        }
    }
}

/// `POST /submitBlock`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBlockRequest {
    pub proof: Proof,
    pub farmer_addr: Address,
    pub farmer_pubkey_hex: String,
    #[serde(rename = "vdfSeed", default, skip_serializing_if = "Option::is_none")]
    pub vdf_seed: Option<Hash>,
    #[serde(rename = "vdfIterations", default, skip_serializing_if = "Option::is_none")]
    pub vdf_iterations: Option<u64>,
    #[serde(rename = "vdfOutput", default, skip_serializing_if = "Option::is_none")]
    pub vdf_output: Option<Hash>,
}

impl SubmitBlockRequest {
    /// VDF point carried by the request, if all three fields are present
    pub fn vdf(&self) -> Option<VdfState> {
        match (self.vdf_seed, self.vdf_iterations, self.vdf_output) {
            (Some(seed), Some(iterations), Some(output)) => Some(VdfState {
                seed,
                iterations,
                output,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBlockResponse {
    pub status: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
}

/// `{ok, hash}` or `{ok: false, error}` for transaction endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitTxResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `GET /blocks/range`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocksRangeResponse {
    pub from: u64,
    pub to: u64,
    pub blocks: Vec<Block>,
    pub tip: u64,
}

/// `GET /balance/:addr` and `GET /account/:addr`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResponse {
    pub address: String,
    pub balance: i64,
    pub nonce: u64,
}

mod u64_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&v.to_string())
    }

    /// Accepts a decimal string or a bare number
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Num(u64),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    #[test]
    fn test_chain_tip_encoding() {
        let tip = ChainTipResponse::from(ChainTip {
            height: 12,
            hash: Hash([1; 32]),
            difficulty: 1u64 << 50,
            cumulative_work: 0,
        });
        let json = serde_json::to_value(&tip).unwrap();
        assert_eq!(json["height"], "12");
        assert_eq!(json["difficulty"], "1125899906842624");
        assert_eq!(json["blockHash"], json["hash"]);

        let raw = format!(
            r#"{{"height":12,"hash":"{0}","blockHash":"{0}","difficulty":"5"}}"#,
            Hash([1; 32])
        );
        let back: ChainTipResponse = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.height, 12);
        assert_eq!(back.difficulty, 5);
    }

    #[test]
    fn test_submit_block_vdf_fields() {
        let json = serde_json::json!({
            "proof": {
                "challenge": Hash([1; 32]),
                "plot_id": Hash([2; 32]),
                "farmer_pubkey": PrivateKey::from_bytes(&[1; 32]).unwrap().public_key(),
                "index": 0,
                "hash": Hash([3; 32]),
                "quality": 7
            },
            "farmer_addr": format!("0x{}", "ab".repeat(20)),
            "farmer_pubkey_hex": "",
            "vdfSeed": Hash([4; 32]),
            "vdfIterations": 9,
            "vdfOutput": Hash([5; 32]),
        });
        let req: SubmitBlockRequest = serde_json::from_value(json).unwrap();
        let vdf = req.vdf().unwrap();
        assert_eq!(vdf.iterations, 9);
        assert_eq!(vdf.output, Hash([5; 32]));
    }
}
