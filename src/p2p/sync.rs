//! Block sync bookkeeping: out-of-order singletons, busy backoff, fork walks

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::PeerError;
use crate::consensus::Block;
use crate::constants::MAX_REORG_DEPTH;
use crate::crypto::Hash;

/// Busy replies tolerated per range before giving up on that peer
pub const MAX_BUSY_ATTEMPTS: u32 = 5;

/// Blocks buffered by a single fork walk
const MAX_WALK_BLOCKS: usize = 1024;

/// Heights we asked for and blocks that arrived ahead of the tip
#[derive(Debug, Default)]
pub struct SyncState {
    wanted_heights: BTreeSet<u64>,
    queued_blocks: BTreeMap<u64, Block>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `height` as requested; false if it already was
    pub fn want(&mut self, height: u64) -> bool {
        self.wanted_heights.insert(height)
    }

    pub fn is_wanted(&self, height: u64) -> bool {
        self.wanted_heights.contains(&height)
    }

    /// Hold a block that cannot be applied yet
    pub fn queue(&mut self, block: Block) {
        self.wanted_heights.remove(&block.height);
        self.queued_blocks.insert(block.height, block);
    }

    pub fn queued_len(&self) -> usize {
        self.queued_blocks.len()
    }

    /// Remove and return queued blocks that continue `local_height` without a gap
    pub fn drain_ready(&mut self, local_height: u64) -> Vec<Block> {
        self.prune(local_height);
        let mut ready = Vec::new();
        let mut next = local_height + 1;
        while let Some(block) = self.queued_blocks.remove(&next) {
            ready.push(block);
            next += 1;
        }
        ready
    }

    /// Forget everything at or below `local_height`
    pub fn prune(&mut self, local_height: u64) {
        self.queued_blocks = self.queued_blocks.split_off(&(local_height + 1));
        self.wanted_heights = self.wanted_heights.split_off(&(local_height + 1));
    }
}

/// Linear backoff for busy range replies: `attempt × 1 s`
#[derive(Debug, Default, Clone, Copy)]
pub struct BusyBackoff {
    attempts: u32,
}

impl BusyBackoff {
    /// Delay before the next retry, or None once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= MAX_BUSY_ATTEMPTS {
            return None;
        }
        self.attempts += 1;
        Some(Duration::from_secs(u64::from(self.attempts)))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Outcome of feeding a block to a fork walk
#[derive(Debug, PartialEq, Eq)]
pub enum WalkStep {
    /// Ask the peer for this height next
    Request(u64),
    /// The branch links to our chain; blocks in ascending order
    Complete(Vec<Block>),
}

/// Backward walk from an unlinked block towards our chain
///
/// Blocks are fetched one at a time with `GetBlock(h-1)` from the peer that
/// sent the first one.
#[derive(Debug)]
pub struct ForkWalk {
    peer: String,
    /// Descending heights
    blocks: Vec<Block>,
    max_depth: u64,
}

impl ForkWalk {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            blocks: Vec::new(),
            max_depth: MAX_REORG_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u64) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Height the walk is waiting for
    pub fn awaiting(&self) -> Option<u64> {
        self.blocks.last().and_then(|b| b.height.checked_sub(1))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Add the next (lower) block of the branch
    ///
    /// `local_hash_at` answers with our block hash at a height. `local_tip`
    /// bounds how far below our tip the walk may reach.
    pub fn push<F>(&mut self, block: Block, local_tip: u64, local_hash_at: F) -> Result<WalkStep, PeerError>
    where
        F: Fn(u64) -> Option<Hash>,
    {
        if let Some(lowest) = self.blocks.last() {
            if block.height + 1 != lowest.height || block.hash() != lowest.prev_hash {
                return Err(PeerError::Protocol(format!(
                    "fork walk expected parent of height {}, got height {}",
                    lowest.height, block.height
                )));
            }
        }
        let parent = block
            .height
            .checked_sub(1)
            .ok_or_else(|| PeerError::Protocol("peer sent a different genesis".into()))?;
        let links = local_hash_at(parent) == Some(block.prev_hash);
        self.blocks.push(block);

        if links {
            let mut branch = std::mem::take(&mut self.blocks);
            branch.reverse();
            return Ok(WalkStep::Complete(branch));
        }
        if local_tip.saturating_sub(parent) > self.max_depth || self.blocks.len() >= MAX_WALK_BLOCKS {
            return Err(PeerError::ReorgTooDeep(self.max_depth));
        }
        Ok(WalkStep::Request(parent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::sample_block;

    fn chain_from(parent: Hash, start: u64, len: usize, salt: u8) -> Vec<Block> {
        let mut out: Vec<Block> = Vec::new();
        let mut prev = parent;
        for i in 0..len {
            let mut b = sample_block();
            b.height = start + i as u64;
            b.prev_hash = prev;
            b.state_root = Hash([salt; 32]);
            prev = b.hash();
            out.push(b);
        }
        out
    }

    #[test]
    fn test_drain_ready_stops_at_gap() {
        let mut sync = SyncState::new();
        let blocks = chain_from(Hash([0; 32]), 5, 4, 1);
        assert!(sync.want(6));
        assert!(!sync.want(6));
        sync.queue(blocks[1].clone());
        sync.queue(blocks[0].clone());
        sync.queue(blocks[3].clone());
        assert!(!sync.is_wanted(6));

        let ready = sync.drain_ready(4);
        assert_eq!(ready.iter().map(|b| b.height).collect::<Vec<_>>(), vec![5, 6]);
        assert_eq!(sync.queued_len(), 1);

        // height 8 is still waiting on 7
        assert!(sync.drain_ready(6).is_empty());
        assert_eq!(sync.drain_ready(7).len(), 1);
    }

    #[test]
    fn test_prune_drops_old_entries() {
        let mut sync = SyncState::new();
        for b in chain_from(Hash([0; 32]), 1, 3, 1) {
            sync.queue(b);
        }
        sync.want(2);
        sync.prune(2);
        assert_eq!(sync.queued_len(), 1);
        assert!(!sync.is_wanted(2));
    }

    #[test]
    fn test_busy_backoff_is_linear_and_bounded() {
        let mut backoff = BusyBackoff::default();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_fork_walk_completes_at_common_ancestor() {
        let ours = chain_from(Hash([0; 32]), 1, 10, 1);
        let theirs = chain_from(ours[4].hash(), 6, 6, 2);
        let local = |h: u64| ours.get(h as usize - 1).map(Block::hash);

        let mut walk = ForkWalk::new("peer");
        let mut step = walk.push(theirs[5].clone(), 10, local).unwrap();
        let mut idx = 5;
        while let WalkStep::Request(h) = step {
            idx -= 1;
            assert_eq!(theirs[idx].height, h);
            step = walk.push(theirs[idx].clone(), 10, local).unwrap();
        }
        match step {
            WalkStep::Complete(branch) => {
                assert_eq!(branch.len(), 6);
                assert_eq!(branch[0].height, 6);
                assert_eq!(branch[0].prev_hash, ours[4].hash());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(walk.is_empty());
    }

    #[test]
    fn test_fork_walk_rejects_unrelated_block() {
        let theirs = chain_from(Hash([9; 32]), 5, 2, 2);
        let mut walk = ForkWalk::new("peer");
        assert_eq!(walk.push(theirs[1].clone(), 6, |_| None).unwrap(), WalkStep::Request(5));
        assert!(matches!(
            walk.push(theirs[1].clone(), 6, |_| None),
            Err(PeerError::Protocol(_))
        ));
    }

    #[test]
    fn test_fork_walk_abandoned_when_too_deep() {
        let theirs = chain_from(Hash([9; 32]), 1, 5, 2);
        let mut walk = ForkWalk::new("peer").with_max_depth(2);
        assert!(walk.push(theirs[4].clone(), 5, |_| None).is_ok());
        assert!(walk.push(theirs[3].clone(), 5, |_| None).is_ok());
        assert!(matches!(
            walk.push(theirs[2].clone(), 5, |_| None),
            Err(PeerError::ReorgTooDeep(2))
        ));
    }
}
