//! In-memory chain state guarded by the block-pipeline lock

use serde::Serialize;

use crate::consensus::{
    expected_challenge, observed_block_time, retarget, vdf_challenge, Block,
    Consensus, ConsensusParams,
};
use crate::crypto::Hash;
use crate::ledger::WorldState;
use crate::vdf::{seed_for_tip, VdfState, VdfVerifier};

/// Tip summary served by `/chainTip`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainTip {
    pub height: u64,
    pub hash: Hash,
    pub difficulty: u64,
    #[serde(skip)]
    pub cumulative_work: u128,
}

/// Snapshot-consistent `(challenge, difficulty, height)` for farmers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeSnapshot {
    pub challenge: Hash,
    pub difficulty: u64,
    /// Height of the block being farmed (tip + 1)
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vdf: Option<VdfState>,
}

/// Chain, world state, consensus and challenge, all mutated together
#[derive(Debug)]
pub struct ChainState {
    /// Canonical chain; index equals height
    pub blocks: Vec<Block>,
    pub world: WorldState,
    pub consensus: Consensus,
    pub challenge: Hash,
    /// Latest accepted VDF point for the tip; `None` when VDF is off
    pub vdf: Option<VdfState>,
    pub vdf_verifier: VdfVerifier,
    pub vdf_required: bool,
}

impl ChainState {
    /// State over a non-empty chain; challenge and VDF start fresh for the tip
    pub fn new(blocks: Vec<Block>, world: WorldState, consensus: Consensus, vdf_required: bool) -> Self {
        let mut state = Self {
            blocks,
            world,
            consensus,
            challenge: Hash::zero(),
            vdf: None,
            vdf_verifier: VdfVerifier::default(),
            vdf_required,
        };
        state.reset_challenge();
        state
    }

    pub fn tip(&self) -> &Block {
        // constructed non-empty; genesis is never removed
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn tip_height(&self) -> u64 {
        self.tip().height
    }

    pub fn tip_hash(&self) -> Hash {
        self.tip().hash()
    }

    pub fn chain_tip(&self) -> ChainTip {
        let tip = self.tip();
        ChainTip {
            height: tip.height,
            hash: tip.hash(),
            difficulty: self.consensus.difficulty,
            cumulative_work: tip.cumulative_work,
        }
    }

    pub fn block_hash_at(&self, height: u64) -> Option<Hash> {
        self.blocks.get(height as usize).map(Block::hash)
    }

    pub fn snapshot(&self) -> ChallengeSnapshot {
        ChallengeSnapshot {
            challenge: self.challenge,
            difficulty: self.consensus.difficulty,
            height: self.tip_height() + 1,
            vdf: self.vdf,
        }
    }

    /// Seed the timelord must use for the current tip
    pub fn expected_vdf_seed(&self) -> Hash {
        seed_for_tip(&self.tip_hash(), self.tip_height())
    }

    /// Recompute the challenge for tip + 1 and drop VDF progress
    pub fn reset_challenge(&mut self) {
        let tip_hash = self.tip_hash();
        let next = self.tip_height() + 1;
        self.vdf_verifier.reset();
        if self.vdf_required {
            let start = VdfState::at_seed(self.expected_vdf_seed());
            self.challenge = vdf_challenge(&start.output, next);
            self.vdf = Some(start);
        } else {
            self.challenge = expected_challenge(&tip_hash, next);
            self.vdf = None;
        }
    }

    /// Timestamps of the retarget window ending at `height` (inclusive)
    pub fn retarget_window(&self, height: u64) -> Vec<i64> {
        window_timestamps(&self.blocks, height, self.consensus.params.retarget_interval)
    }
}

fn window_timestamps(blocks: &[Block], height: u64, interval: u64) -> Vec<i64> {
    let end = (height as usize + 1).min(blocks.len());
    let start = end.saturating_sub(interval as usize + 1);
    blocks[start..end].iter().map(|b| b.timestamp_unix).collect()
}

/// Difficulty required of the block after `height`
pub fn difficulty_after(blocks: &[Block], height: u64, params: &ConsensusParams) -> u64 {
    let current = blocks.get(height as usize).map_or(params.initial_difficulty, |b| b.difficulty);
    if !params.retarget_due(height) {
        return current;
    }
    let window = window_timestamps(blocks, height, params.retarget_interval);
    retarget(current, observed_block_time(&window), params)
}
