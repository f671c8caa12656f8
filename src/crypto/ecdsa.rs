//! secp256k1 ECDSA keys for legacy transfers and farmer identities
//!
//! Signatures are DER-encoded and computed over a SHA-256 digest that the
//! caller has already produced (prehash signing).

use k256::ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::{Address, Hash};

/// Signature errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// secp256k1 private key
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey([REDACTED])")
    }
}

/// 33-byte compressed secp256k1 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub [u8; 33]);

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        PrivateKey(SigningKey::random(&mut OsRng))
    }

    /// Create from 32 bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignatureError> {
        SigningKey::from_slice(bytes)
            .map(PrivateKey)
            .map_err(|_| SignatureError::InvalidPrivateKey)
    }

    /// Parse a hex-encoded 32-byte secret
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s.trim().trim_start_matches("0x"))
            .map_err(|_| SignatureError::InvalidPrivateKey)?;
        Self::from_bytes(&bytes)
    }

    /// Get the corresponding compressed public key
    pub fn public_key(&self) -> PublicKey {
        let point = self.0.verifying_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        PublicKey(out)
    }

    /// Sign a 32-byte digest, returning a DER signature
    pub fn sign_digest(&self, digest: &Hash) -> Result<Vec<u8>, SignatureError> {
        let signature: Signature = self
            .0
            .sign_prehash(&digest.0)
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    /// Export to bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }
}

impl PublicKey {
    /// Parse a SEC1 key (compressed or uncompressed) into compressed form
    pub fn from_sec1(bytes: &[u8]) -> Result<Self, SignatureError> {
        let key =
            VerifyingKey::from_sec1_bytes(bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
        let point = key.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        Ok(PublicKey(out))
    }

    /// Verify a DER signature over a digest
    pub fn verify_digest(&self, digest: &Hash, der: &[u8]) -> Result<(), SignatureError> {
        let key =
            VerifyingKey::from_sec1_bytes(&self.0).map_err(|_| SignatureError::InvalidPublicKey)?;
        let signature = Signature::from_der(der).map_err(|_| SignatureError::InvalidSignature)?;
        key.verify_prehash(&digest.0, &signature)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    /// Address used by legacy transfers and farmer rewards
    pub fn legacy_address(&self) -> Address {
        Address::from_legacy_pubkey(&self.0)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s.trim().trim_start_matches("0x"))
            .map_err(|_| SignatureError::InvalidPublicKey)?;
        Self::from_sec1(&bytes)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    #[test]
    fn test_sign_verify() {
        let key = PrivateKey::generate();
        let digest = sha256(b"transfer");
        let sig = key.sign_digest(&digest).unwrap();
        assert!(key.public_key().verify_digest(&digest, &sig).is_ok());
    }

    #[test]
    fn test_wrong_digest_fails() {
        let key = PrivateKey::generate();
        let sig = key.sign_digest(&sha256(b"a")).unwrap();
        assert_eq!(
            key.public_key().verify_digest(&sha256(b"b"), &sig),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = PrivateKey::generate();
        let other = PrivateKey::generate();
        let digest = sha256(b"a");
        let sig = key.sign_digest(&digest).unwrap();
        assert!(other.public_key().verify_digest(&digest, &sig).is_err());
    }

    #[test]
    fn test_private_key_roundtrip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_hex(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(key.public_key(), restored.public_key());
    }

    #[test]
    fn test_legacy_address_is_sha256_prefix() {
        let key = PrivateKey::generate();
        let pk = key.public_key();
        assert_eq!(pk.legacy_address().0[..], sha256(&pk.0).0[..20]);
    }

    #[test]
    fn test_invalid_public_key_rejected() {
        assert!(PublicKey::from_sec1(&[0u8; 33]).is_err());
    }
}
