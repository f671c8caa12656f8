//! Farming challenges

use crate::constants::GENESIS_CHALLENGE_SEED;
use crate::crypto::{double_sha256, sha256, Hash};
use crate::vdf::{challenge_from_output, seed_for_tip};

/// Challenge for the first block after genesis
pub fn genesis_challenge() -> Hash {
    sha256(GENESIS_CHALLENGE_SEED.as_bytes())
}

/// Non-VDF challenge for block `height`: double-SHA256(prev_hash || height_le64)
pub fn challenge_for_height(prev_hash: &Hash, height: u64) -> Hash {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(&prev_hash.0);
    buf.extend_from_slice(&height.to_le_bytes());
    double_sha256(&buf)
}

/// Challenge a block at `height` must answer when VDF is off
pub fn expected_challenge(prev_hash: &Hash, height: u64) -> Hash {
    if height <= 1 {
        genesis_challenge()
    } else {
        challenge_for_height(prev_hash, height)
    }
}

/// VDF seed a block at `height` must carry: the timelord seed of its parent
pub fn expected_vdf_seed(prev_hash: &Hash, height: u64) -> Hash {
    seed_for_tip(prev_hash, height.saturating_sub(1))
}

/// Challenge for `height` once the VDF has produced `output`
pub fn vdf_challenge(output: &Hash, height: u64) -> Hash {
    challenge_from_output(output, height)
}
