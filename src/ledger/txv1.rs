//! TxV1: canonical-JSON transfers signed with Ed25519
//!
//! The signed message is `BLAKE2b-256("Archivas-TxV1" || canonical_json)`.
//! Canonical JSON has sorted keys, no whitespace, and omits an empty memo.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::tx::TxError;
use crate::crypto::{Address, Hash};

type Blake2b256 = Blake2b<U32>;

/// Domain separator prepended to the canonical JSON before hashing
pub const TXV1_DOMAIN: &[u8] = b"Archivas-TxV1";

/// Longest memo accepted, in bytes
pub const MAX_MEMO_BYTES: usize = 256;

/// Unsigned transfer body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxV1 {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memo: String,
}

impl TxV1 {
    pub fn transfer(from: &Address, to: &Address, amount: u64, fee: u64, nonce: u64) -> Self {
        Self {
            kind: "transfer".to_string(),
            from: from.to_bech32(),
            to: to.to_bech32(),
            amount,
            fee,
            nonce,
            memo: String::new(),
        }
    }

    pub fn with_memo(mut self, memo: impl Into<String>) -> Self {
        self.memo = memo.into();
        self
    }

    pub fn validate(&self) -> Result<(), TxError> {
        if self.kind != "transfer" {
            return Err(TxError::Invalid(format!(
                "invalid type: expected 'transfer', got '{}'",
                self.kind
            )));
        }
        if self.from.is_empty() {
            return Err(TxError::Invalid("from address is required".into()));
        }
        if self.to.is_empty() {
            return Err(TxError::Invalid("to address is required".into()));
        }
        if self.amount == 0 {
            return Err(TxError::Invalid("amount must be greater than 0".into()));
        }
        if self.fee == 0 {
            return Err(TxError::Invalid("fee must be greater than 0".into()));
        }
        if self.memo.len() > MAX_MEMO_BYTES {
            return Err(TxError::Invalid(format!(
                "memo exceeds maximum length: {} bytes (max {})",
                self.memo.len(),
                MAX_MEMO_BYTES
            )));
        }
        Ok(())
    }

    /// Keys in sorted order: amount, fee, from, memo, nonce, to, type
    pub fn canonical_json(&self) -> String {
        let mut out = String::with_capacity(160);
        out.push('{');
        out.push_str(&format!("\"amount\":{},", self.amount));
        out.push_str(&format!("\"fee\":{},", self.fee));
        out.push_str("\"from\":");
        push_json_string(&mut out, &self.from);
        if !self.memo.is_empty() {
            out.push_str(",\"memo\":");
            push_json_string(&mut out, &self.memo);
        }
        out.push_str(&format!(",\"nonce\":{},", self.nonce));
        out.push_str("\"to\":");
        push_json_string(&mut out, &self.to);
        out.push_str(",\"type\":");
        push_json_string(&mut out, &self.kind);
        out.push('}');
        out
    }

    pub fn hash(&self) -> Hash {
        let mut hasher = Blake2b256::new();
        hasher.update(TXV1_DOMAIN);
        hasher.update(self.canonical_json().as_bytes());
        Hash(hasher.finalize().into())
    }

    /// Sign with an Ed25519 key, producing the wire form
    pub fn sign(self, key: &SigningKey) -> Result<SignedTx, TxError> {
        self.validate()?;
        let hash = self.hash();
        let sig = key.sign(&hash.0);
        Ok(SignedTx {
            pubkey: BASE64.encode(key.verifying_key().as_bytes()),
            sig: BASE64.encode(sig.to_bytes()),
            hash: hash.to_hex(),
            tx: self,
        })
    }
}

/// JSON string escaping, including `<`, `>` and `&` as `\u00XX`
fn push_json_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '<' | '>' | '&' | '\u{2028}' | '\u{2029}' => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Wire form of a signed TxV1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTx {
    pub tx: TxV1,
    /// base64 or hex of the 32-byte Ed25519 public key
    pub pubkey: String,
    /// base64 of the 64-byte signature
    pub sig: String,
    /// hex of the 32-byte transaction hash
    pub hash: String,
}

impl SignedTx {
    pub fn sender(&self) -> Result<Address, TxError> {
        Address::parse(&self.tx.from).map_err(|e| TxError::Invalid(format!("from: {}", e)))
    }

    pub fn recipient(&self) -> Result<Address, TxError> {
        Address::parse(&self.tx.to).map_err(|e| TxError::Invalid(format!("to: {}", e)))
    }

    /// Hash recomputed from the body; errors if the body is invalid
    pub fn computed_hash(&self) -> Result<Hash, TxError> {
        self.tx.validate()?;
        Ok(self.tx.hash())
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey, TxError> {
        let bytes = decode_pubkey(&self.pubkey)?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|e| TxError::InvalidSignature(format!("public key: {}", e)))
    }

    /// Full check: body, hash, sender derivation and signature
    pub fn verify(&self) -> Result<(), TxError> {
        let hash = self.computed_hash()?;
        let claimed = Hash::from_hex(&self.hash)
            .map_err(|_| TxError::Invalid("hash must be 32 bytes of hex".into()))?;
        if claimed != hash {
            return Err(TxError::Invalid("hash does not match transaction body".into()));
        }

        let key = self.verifying_key()?;
        if Address::from_ed25519(key.as_bytes()) != self.sender()? {
            return Err(TxError::SenderMismatch);
        }
        self.recipient()?;

        let sig_bytes = BASE64
            .decode(&self.sig)
            .map_err(|e| TxError::InvalidSignature(format!("signature encoding: {}", e)))?;
        let sig_arr: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
            TxError::InvalidSignature(format!("signature must be 64 bytes, got {}", sig_bytes.len()))
        })?;
        key.verify(&hash.0, &Signature::from_bytes(&sig_arr))
            .map_err(|_| TxError::InvalidSignature("ed25519 verification failed".into()))
    }
}

/// Public keys travel as base64, hex is accepted too
fn decode_pubkey(encoded: &str) -> Result<[u8; 32], TxError> {
    let candidates = [BASE64.decode(encoded).ok(), hex::decode(encoded).ok()];
    candidates
        .into_iter()
        .flatten()
        .find_map(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
        .ok_or_else(|| {
            TxError::InvalidSignature(
                "invalid public key encoding: must be 32 bytes (base64 or hex)".into(),
            )
        })
}
