//! Transactions: coinbase, legacy ECDSA transfers and TxV1 transfers

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::txv1::SignedTx;
use crate::constants::COINBASE_SENDER;
use crate::crypto::{sha256_concat, Address, Hash, PrivateKey, PublicKey, SignatureError};

/// Transaction validation and application errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TxError {
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("insufficient funds: need {need}, have {have}")]
    InsufficientFunds { need: i128, have: i64 },
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("sender public key does not match from address")]
    SenderMismatch,
    #[error("coinbase transaction not allowed here")]
    CoinbaseNotAllowed,
    #[error("invalid transaction: {0}")]
    Invalid(String),
    #[error("balance overflow")]
    BalanceOverflow,
}

impl From<SignatureError> for TxError {
    fn from(e: SignatureError) -> Self {
        TxError::InvalidSignature(e.to_string())
    }
}

/// secp256k1-signed value transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyTx {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
    pub nonce: u64,
    pub sender_pubkey: PublicKey,
    /// DER-encoded ECDSA signature
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

impl LegacyTx {
    /// Build and sign a transfer from the key's legacy address
    pub fn signed(
        key: &PrivateKey,
        to: Address,
        amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<Self, TxError> {
        let sender_pubkey = key.public_key();
        let mut tx = Self {
            from: sender_pubkey.legacy_address(),
            to,
            amount,
            fee,
            nonce,
            sender_pubkey,
            signature: Vec::new(),
        };
        tx.signature = key.sign_digest(&tx.signing_digest())?;
        Ok(tx)
    }

    /// SHA256(from || to || amount_be || fee_be || nonce_be || sender_pubkey)
    pub fn signing_digest(&self) -> Hash {
        sha256_concat(&[
            &self.from.0,
            &self.to.0,
            &self.amount.to_be_bytes(),
            &self.fee.to_be_bytes(),
            &self.nonce.to_be_bytes(),
            &self.sender_pubkey.0,
        ])
    }

    /// Check the key owns `from` and the signature covers the digest
    pub fn verify(&self) -> Result<(), TxError> {
        if self.sender_pubkey.legacy_address() != self.from {
            return Err(TxError::SenderMismatch);
        }
        if self.amount == 0 {
            return Err(TxError::Invalid("amount must be greater than 0".into()));
        }
        self.sender_pubkey
            .verify_digest(&self.signing_digest(), &self.signature)?;
        Ok(())
    }
}

/// Any transaction that can appear in a block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transaction {
    /// Block reward mint; only valid as the first transaction
    Coinbase {
        to: Address,
        amount: u64,
        #[serde(default)]
        height: u64,
    },
    /// Legacy ECDSA transfer
    Transfer(LegacyTx),
    /// Ed25519 canonical-JSON transfer
    V1(SignedTx),
}

impl Transaction {
    pub fn coinbase(to: Address, amount: u64, height: u64) -> Self {
        Transaction::Coinbase { to, amount, height }
    }

    pub fn is_coinbase(&self) -> bool {
        matches!(self, Transaction::Coinbase { .. })
    }

    /// Sender address; `None` for the coinbase
    pub fn sender(&self) -> Option<Address> {
        match self {
            Transaction::Coinbase { .. } => None,
            Transaction::Transfer(tx) => Some(tx.from),
            Transaction::V1(tx) => tx.sender().ok(),
        }
    }

    /// Display form of the sender, `"coinbase"` for the mint
    pub fn from_label(&self) -> String {
        match self.sender() {
            Some(addr) => addr.to_hex(),
            None => COINBASE_SENDER.to_string(),
        }
    }

    pub fn recipient(&self) -> Address {
        match self {
            Transaction::Coinbase { to, .. } => *to,
            Transaction::Transfer(tx) => tx.to,
            Transaction::V1(tx) => tx.recipient().unwrap_or_default(),
        }
    }

    pub fn amount(&self) -> u64 {
        match self {
            Transaction::Coinbase { amount, .. } => *amount,
            Transaction::Transfer(tx) => tx.amount,
            Transaction::V1(tx) => tx.tx.amount,
        }
    }

    pub fn fee(&self) -> u64 {
        match self {
            Transaction::Coinbase { .. } => 0,
            Transaction::Transfer(tx) => tx.fee,
            Transaction::V1(tx) => tx.tx.fee,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            Transaction::Coinbase { .. } => 0,
            Transaction::Transfer(tx) => tx.nonce,
            Transaction::V1(tx) => tx.tx.nonce,
        }
    }

    /// Transaction hash
    ///
    /// Legacy transfers hash to their signing digest, TxV1 to the
    /// domain-separated BLAKE2b hash, and the coinbase to
    /// `SHA256("coinbase" || to || amount_be || height_be)`.
    pub fn hash(&self) -> Hash {
        match self {
            Transaction::Coinbase { to, amount, height } => sha256_concat(&[
                COINBASE_SENDER.as_bytes(),
                &to.0,
                &amount.to_be_bytes(),
                &height.to_be_bytes(),
            ]),
            Transaction::Transfer(tx) => tx.signing_digest(),
            Transaction::V1(tx) => tx.computed_hash().unwrap_or_default(),
        }
    }

    /// Verify signature and ownership; the coinbase is never verified here
    pub fn verify(&self) -> Result<(), TxError> {
        match self {
            Transaction::Coinbase { .. } => Err(TxError::CoinbaseNotAllowed),
            Transaction::Transfer(tx) => tx.verify(),
            Transaction::V1(tx) => tx.verify(),
        }
    }

    /// Approximate encoded size for fee estimation
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |v| v.len())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}
