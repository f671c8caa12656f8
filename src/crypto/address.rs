//! 20-byte account addresses
//!
//! An address has two external encodings that interconvert losslessly:
//! lowercase `0x` hex and Bech32 with the `arcv` prefix. Equality is byte
//! equality; state lookups always use the hex form.

use bech32::{FromBase32, ToBase32, Variant};
use blake2::digest::consts::U20;
use blake2::{Blake2b, Digest};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::Keccak256;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::constants::BECH32_HRP;

type Blake2b160 = Blake2b<U20>;

/// Address parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must start with 0x or {0}1")]
    UnknownEncoding(&'static str),
    #[error("invalid hex address: {0}")]
    InvalidHex(String),
    #[error("invalid bech32 address: {0}")]
    InvalidBech32(String),
    #[error("wrong bech32 prefix: expected {expected}, got {got}")]
    WrongPrefix { expected: &'static str, got: String },
    #[error("address must be 20 bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid public key")]
    InvalidPublicKey,
}

/// Canonical 20-byte address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AddressError> {
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| AddressError::InvalidLength(bytes.len()))?;
        Ok(Address(arr))
    }

    /// Parse either encoding: `0x` + 40 hex chars, or `arcv1...` bech32
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let trimmed = s.trim();
        if let Some(hex_part) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            let bytes = hex::decode(hex_part)
                .map_err(|e| AddressError::InvalidHex(e.to_string()))?;
            return Self::from_slice(&bytes);
        }
        if trimmed.to_ascii_lowercase().starts_with(&format!("{}1", BECH32_HRP)) {
            return Self::from_bech32(trimmed);
        }
        Err(AddressError::UnknownEncoding(BECH32_HRP))
    }

    /// Decode a bech32 address, requiring the `arcv` prefix
    pub fn from_bech32(s: &str) -> Result<Self, AddressError> {
        let (hrp, data, _variant) =
            bech32::decode(s).map_err(|e| AddressError::InvalidBech32(e.to_string()))?;
        if hrp != BECH32_HRP {
            return Err(AddressError::WrongPrefix {
                expected: BECH32_HRP,
                got: hrp,
            });
        }
        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| AddressError::InvalidBech32(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Lowercase `0x`-prefixed hex, the canonical state-store key
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Bech32 encoding with the `arcv` prefix
    pub fn to_bech32(&self) -> String {
        // constant HRP, encoding only fails on an invalid prefix
        bech32::encode(BECH32_HRP, self.0.to_base32(), Variant::Bech32)
            .unwrap_or_else(|_| self.to_hex())
    }

    /// Legacy transfer address: first 20 bytes of SHA256(compressed pubkey)
    pub fn from_legacy_pubkey(compressed: &[u8]) -> Self {
        let digest = super::sha256(compressed);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest.0[..20]);
        Address(out)
    }

    /// TxV1 address: BLAKE2b-160 of the Ed25519 public key
    pub fn from_ed25519(pubkey: &[u8; 32]) -> Self {
        let digest = Blake2b160::digest(pubkey);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        Address(out)
    }

    /// Ethereum-style address: keccak256(uncompressed[1..])[12..]
    ///
    /// Accepts either the compressed or uncompressed SEC1 encoding.
    pub fn from_evm_pubkey(sec1: &[u8]) -> Result<Self, AddressError> {
        let key =
            k256::PublicKey::from_sec1_bytes(sec1).map_err(|_| AddressError::InvalidPublicKey)?;
        let point = key.to_encoded_point(false);
        let digest = Keccak256::digest(&point.as_bytes()[1..]);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest[12..]);
        Ok(Address(out))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Normalize any supported address string to the canonical hex key
pub fn canonical_address(s: &str) -> Result<String, AddressError> {
    Address::parse(s).map(|a| a.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let addr = Address([0xab; 20]);
        let hex = addr.to_hex();
        assert_eq!(hex, format!("0x{}", "ab".repeat(20)));
        assert_eq!(Address::parse(&hex).unwrap(), addr);
        assert_eq!(Address::parse(&hex.to_uppercase().replace("0X", "0x")).unwrap(), addr);
    }

    #[test]
    fn test_bech32_roundtrip() {
        let addr = Address([7u8; 20]);
        let b32 = addr.to_bech32();
        assert!(b32.starts_with("arcv1"));
        assert_eq!(Address::parse(&b32).unwrap(), addr);
    }

    #[test]
    fn test_rejects_unknown_encoding() {
        assert_eq!(
            Address::parse("abcdef"),
            Err(AddressError::UnknownEncoding(BECH32_HRP))
        );
        assert!(matches!(
            Address::parse("0x1234"),
            Err(AddressError::InvalidLength(2))
        ));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut b32 = Address([1u8; 20]).to_bech32();
        let last = b32.pop().unwrap();
        b32.push(if last == 'q' { 'p' } else { 'q' });
        assert!(matches!(
            Address::parse(&b32),
            Err(AddressError::InvalidBech32(_))
        ));
    }

    #[test]
    fn test_evm_derivation_from_known_key() {
        // Private key 1: generator point, well-known address
        let secret = k256::SecretKey::from_slice(&{
            let mut k = [0u8; 32];
            k[31] = 1;
            k
        })
        .unwrap();
        let pubkey = secret.public_key().to_encoded_point(false);
        let addr = Address::from_evm_pubkey(pubkey.as_bytes()).unwrap();
        assert_eq!(addr.to_hex(), "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf");

        let compressed = secret.public_key().to_encoded_point(true);
        assert_eq!(Address::from_evm_pubkey(compressed.as_bytes()).unwrap(), addr);
    }

    #[test]
    fn test_serde_accepts_both_encodings() {
        let addr = Address([9u8; 20]);
        let from_hex: Address = serde_json::from_str(&format!("\"{}\"", addr.to_hex())).unwrap();
        let from_b32: Address =
            serde_json::from_str(&format!("\"{}\"", addr.to_bech32())).unwrap();
        assert_eq!(from_hex, from_b32);
        assert_eq!(serde_json::to_string(&addr).unwrap(), format!("\"{}\"", addr.to_hex()));
    }
}
