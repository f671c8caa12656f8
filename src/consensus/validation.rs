//! Block validation
//!
//! Pure checks used by both the local submit path and the peer path. State
//! application and root checks live in the node pipeline.

use thiserror::Error;

use super::block::Block;
use super::challenge::{expected_vdf_seed, vdf_challenge};
use crate::crypto::Hash;
use crate::ledger::{Transaction, TxError};
use crate::pospace::{verify_proof, ProofError};
use crate::vdf::{VdfError, VdfState, VdfVerifier};

/// Block validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid proof: {0}")]
    InvalidProof(#[from] ProofError),
    #[error("block carries no proof")]
    MissingProof,
    #[error("vdf verify failed: {0}")]
    VdfVerifyFailed(#[from] VdfError),
    #[error("block is missing vdf fields")]
    MissingVdf,
    #[error("block challenge does not match expected challenge")]
    ChallengeMismatch,
    #[error("expected height {expected}, got {got}")]
    HeightMismatch { expected: u64, got: u64 },
    #[error("prev_hash does not link to tip")]
    PrevHashMismatch,
    #[error("expected difficulty {expected}, got {got}")]
    DifficultyMismatch { expected: u64, got: u64 },
    #[error("expected cumulative work {expected}, got {got}")]
    WorkMismatch { expected: u128, got: u128 },
    #[error("bad coinbase: {0}")]
    BadCoinbase(String),
    #[error("transaction {index} invalid: {source}")]
    InvalidTransaction { index: usize, source: TxError },
    #[error("state root mismatch")]
    StateRootMismatch,
    #[error("receipts root mismatch")]
    ReceiptsRootMismatch,
    #[error("gas used {used} exceeds limit {limit}")]
    GasLimitExceeded { used: u64, limit: u64 },
    #[error("reorg too deep: {depth} blocks (max {max})")]
    ReorgTooDeep { depth: u64, max: u64 },
    #[error("competing chain has no more work than ours")]
    InsufficientWork,
}

/// `block` must sit directly on `(tip_height, tip_hash)`
pub fn check_link(block: &Block, tip_height: u64, tip_hash: &Hash) -> Result<(), ValidationError> {
    if block.height != tip_height + 1 {
        return Err(ValidationError::HeightMismatch {
            expected: tip_height + 1,
            got: block.height,
        });
    }
    if block.prev_hash != *tip_hash {
        return Err(ValidationError::PrevHashMismatch);
    }
    Ok(())
}

/// Check the VDF fields of `block` and return the challenge they imply
///
/// Seed, iteration bound, challenge and proof are checked before the hash
/// chain is recomputed.
pub fn check_vdf(block: &Block, verifier: &mut VdfVerifier) -> Result<Hash, ValidationError> {
    let (seed, output) = match (block.vdf_seed, block.vdf_output) {
        (Some(seed), Some(output)) => (seed, output),
        _ => return Err(ValidationError::MissingVdf),
    };
    let expected = expected_vdf_seed(&block.prev_hash, block.height);
    if seed != expected {
        return Err(VdfError::SeedMismatch { expected, got: seed }.into());
    }
    if block.vdf_iterations > verifier.max_delta() {
        return Err(VdfError::DeltaTooLarge {
            delta: block.vdf_iterations,
            max: verifier.max_delta(),
        }
        .into());
    }
    let challenge = vdf_challenge(&output, block.height);
    check_proof(block, &challenge)?;
    verifier.verify(&VdfState {
        seed,
        iterations: block.vdf_iterations,
        output,
    })?;
    Ok(challenge)
}

/// Block challenge must equal `expected` and the proof must win it
pub fn check_proof(block: &Block, expected: &Hash) -> Result<(), ValidationError> {
    if block.challenge != *expected {
        return Err(ValidationError::ChallengeMismatch);
    }
    let proof = block.proof.as_ref().ok_or(ValidationError::MissingProof)?;
    verify_proof(proof, expected, block.difficulty)?;
    Ok(())
}

/// `txs[0]` pays exactly `reward` to the farmer at the block's height; no other coinbase
pub fn check_coinbase(block: &Block, reward: u64) -> Result<(), ValidationError> {
    match block.txs.first() {
        Some(Transaction::Coinbase { to, amount, height }) => {
            if *height != block.height {
                return Err(ValidationError::BadCoinbase(format!(
                    "minted at height {} in block {}",
                    height, block.height
                )));
            }
            if *to != block.farmer_addr {
                return Err(ValidationError::BadCoinbase(format!(
                    "pays {} instead of farmer {}",
                    to, block.farmer_addr
                )));
            }
            if *amount != reward {
                return Err(ValidationError::BadCoinbase(format!(
                    "amount {} != reward {}",
                    amount, reward
                )));
            }
        }
        _ => return Err(ValidationError::BadCoinbase("txs[0] is not a coinbase".into())),
    }
    if block.txs.iter().skip(1).any(Transaction::is_coinbase) {
        return Err(ValidationError::BadCoinbase("extra coinbase".into()));
    }
    Ok(())
}

/// Re-verify signatures of every user transaction
pub fn check_signatures(block: &Block) -> Result<(), ValidationError> {
    for (index, tx) in block.txs.iter().enumerate().skip(1) {
        tx.verify()
            .map_err(|source| ValidationError::InvalidTransaction { index, source })?;
    }
    Ok(())
}
