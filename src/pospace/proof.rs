//! Proofs of space and their verification

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::plot::{compute_plot_hash, plot_id_for};
use crate::crypto::{sha256_concat, Hash, PublicKey};

/// Size of the quality domain: quality is a u64, so every value is below 2^64
pub const QMAX: u128 = 1u128 << 64;

/// Proof verification failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("proof challenge does not match expected challenge")]
    ChallengeMismatch,
    #[error("plot id is not derived from farmer key")]
    PlotIdMismatch,
    #[error("plot hash does not match recomputed entry {index}")]
    HashMismatch { index: u64 },
    #[error("stated quality {stated} != computed {computed}")]
    QualityMismatch { stated: u64, computed: u64 },
    #[error("quality {quality} does not beat difficulty {difficulty}")]
    QualityTooHigh { quality: u64, difficulty: u64 },
}

/// A plot entry offered as the answer to a challenge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub challenge: Hash,
    pub plot_id: Hash,
    pub farmer_pubkey: PublicKey,
    pub index: u64,
    pub hash: Hash,
    pub quality: u64,
}

impl Proof {
    /// Build a proof for the entry at `index`, recomputing hash and quality
    pub fn from_entry(challenge: Hash, farmer_pubkey: PublicKey, index: u64) -> Self {
        let plot_id = plot_id_for(&farmer_pubkey);
        let hash = compute_plot_hash(&farmer_pubkey, &plot_id, index);
        Self {
            challenge,
            plot_id,
            farmer_pubkey,
            index,
            hash,
            quality: quality(&challenge, &hash),
        }
    }

    /// Digest committed into the block header
    pub fn digest(&self) -> Hash {
        sha256_concat(&[
            &self.challenge.0,
            &self.plot_id.0,
            &self.farmer_pubkey.0,
            &self.index.to_be_bytes(),
            &self.hash.0,
            &self.quality.to_be_bytes(),
        ])
    }

    pub fn is_winner(&self, difficulty: u64) -> bool {
        self.quality < difficulty
    }
}

/// `u64_le(SHA256(challenge || hash)[0..8])`; lower is better
pub fn quality(challenge: &Hash, hash: &Hash) -> u64 {
    let digest = sha256_concat(&[&challenge.0, &hash.0]);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.0[..8]);
    u64::from_le_bytes(first)
}

/// Check a proof against the expected challenge and difficulty
///
/// `quality == difficulty` is a loss.
pub fn verify_proof(proof: &Proof, challenge: &Hash, difficulty: u64) -> Result<(), ProofError> {
    if proof.challenge != *challenge {
        return Err(ProofError::ChallengeMismatch);
    }
    if proof.plot_id != plot_id_for(&proof.farmer_pubkey) {
        return Err(ProofError::PlotIdMismatch);
    }
    let expected = compute_plot_hash(&proof.farmer_pubkey, &proof.plot_id, proof.index);
    if proof.hash != expected {
        return Err(ProofError::HashMismatch { index: proof.index });
    }
    let computed = quality(challenge, &proof.hash);
    if proof.quality != computed {
        return Err(ProofError::QualityMismatch {
            stated: proof.quality,
            computed,
        });
    }
    if !proof.is_winner(difficulty) {
        return Err(ProofError::QualityTooHigh {
            quality: proof.quality,
            difficulty,
        });
    }
    Ok(())
}

/// Probability that a plot of `num_hashes` entries wins at `difficulty`:
/// `1 - (1 - difficulty/QMAX)^N`
pub fn theoretical_win_rate(difficulty: u64, num_hashes: u64) -> f64 {
    let p = difficulty as f64 / QMAX as f64;
    1.0 - (1.0 - p).powf(num_hashes as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, PrivateKey};

    fn farmer() -> PublicKey {
        PrivateKey::from_bytes(&[3u8; 32]).unwrap().public_key()
    }

    #[test]
    fn test_quality_is_deterministic() {
        let c = sha256(b"challenge");
        let h = sha256(b"entry");
        assert_eq!(quality(&c, &h), quality(&c, &h));
        assert_ne!(quality(&c, &h), quality(&h, &c));
    }

    #[test]
    fn test_valid_proof_verifies() {
        let challenge = sha256(b"c1");
        let proof = Proof::from_entry(challenge, farmer(), 5);
        assert!(verify_proof(&proof, &challenge, u64::MAX).is_ok());
    }

    #[test]
    fn test_quality_equal_to_difficulty_rejected() {
        let challenge = sha256(b"c1");
        let proof = Proof::from_entry(challenge, farmer(), 0);
        assert_eq!(
            verify_proof(&proof, &challenge, proof.quality),
            Err(ProofError::QualityTooHigh {
                quality: proof.quality,
                difficulty: proof.quality
            })
        );
        if proof.quality < u64::MAX {
            assert!(verify_proof(&proof, &challenge, proof.quality + 1).is_ok());
        }
    }

    #[test]
    fn test_wrong_challenge_rejected() {
        let proof = Proof::from_entry(sha256(b"a"), farmer(), 1);
        assert_eq!(
            verify_proof(&proof, &sha256(b"b"), u64::MAX),
            Err(ProofError::ChallengeMismatch)
        );
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let challenge = sha256(b"a");
        let mut proof = Proof::from_entry(challenge, farmer(), 1);
        proof.hash = sha256(b"forged");
        proof.quality = quality(&challenge, &proof.hash);
        assert_eq!(
            verify_proof(&proof, &challenge, u64::MAX),
            Err(ProofError::HashMismatch { index: 1 })
        );
    }

    #[test]
    fn test_tampered_quality_rejected() {
        let challenge = sha256(b"a");
        let mut proof = Proof::from_entry(challenge, farmer(), 2);
        proof.quality = proof.quality.wrapping_add(1);
        assert!(matches!(
            verify_proof(&proof, &challenge, u64::MAX),
            Err(ProofError::QualityMismatch { .. })
        ));
    }

    #[test]
    fn test_win_rate_bounds() {
        assert_eq!(theoretical_win_rate(0, 1024), 0.0);
        let r = theoretical_win_rate(1u64 << 54, 1024);
        assert!(r > 0.0 && r <= 1.0);
    }
}
