//! Block pipeline
//!
//! Every path that moves the tip (local farmer, peer block, reorg) runs under
//! the chain write lock. Persisting the batch is the commit point; anything
//! that fails before it is undone in memory by reverse-applying transactions.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use super::state::{difficulty_after, ChainState, ChallengeSnapshot};
use super::{Node, NodeError};
use crate::consensus::{
    check_coinbase, check_link, check_proof, check_signatures, check_vdf, expected_challenge,
    expected_vdf_seed, vdf_challenge, Block, ReorgInfo, ValidationError,
};
use crate::constants::{BLOCK_GAS_LIMIT, INITIAL_BLOCK_REWARD, TRANSFER_GAS};
use crate::crypto::{Address, Hash};
use crate::ledger::{Account, BlockContext, LegacyTx, Receipt, SignedTx, Transaction, WorldState};
use crate::pospace::{verify_proof, Proof};
use crate::storage::ChainCommit;
use crate::vdf::{VdfError, VdfState, VdfVerifier};

/// Coinbase amount in base units
pub fn block_reward() -> u64 {
    INITIAL_BLOCK_REWARD as u64
}

pub(crate) fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// A winning proof handed in by the local farmer
#[derive(Debug, Clone)]
pub struct BlockSubmission {
    pub proof: Proof,
    pub farmer_addr: Address,
    pub vdf: Option<VdfState>,
}

/// Result of a committed block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AcceptedBlock {
    pub height: u64,
    pub hash: Hash,
    pub txs: usize,
    pub difficulty: u64,
}

/// Every address whose account a block may have changed
fn touched(blocks: &[&Block]) -> BTreeSet<Address> {
    let mut out = BTreeSet::new();
    for tx in blocks.iter().flat_map(|b| b.txs.iter()) {
        out.insert(tx.recipient());
        if let Some(sender) = tx.sender() {
            out.insert(sender);
        }
    }
    out
}

fn account_writes(world: &WorldState, addrs: &BTreeSet<Address>) -> Vec<(Address, Option<Account>)> {
    addrs.iter().map(|a| (*a, world.get(a).copied())).collect()
}

impl Node {
    /// Build, apply and commit a block around a locally farmed proof
    pub fn submit_block(&self, submission: BlockSubmission) -> Result<AcceptedBlock, NodeError> {
        self.metrics.submit_received.inc();
        match self.build_and_commit(submission) {
            Ok(accepted) => {
                self.metrics.submit_accepted.inc();
                self.broadcast(accepted.height, accepted.hash);
                Ok(accepted)
            }
            Err(e) => {
                self.metrics.submit_ignored.inc();
                warn!("[block] submission rejected: {}", e);
                Err(e)
            }
        }
    }

    fn build_and_commit(&self, submission: BlockSubmission) -> Result<AcceptedBlock, NodeError> {
        if self.is_halted() {
            return Err(NodeError::Halted);
        }
        let mut chain = self.chain.write();
        let tip = chain.tip().clone();
        let tip_hash = tip.hash();
        let next = tip.height + 1;

        let (challenge, vdf) = if self.config.vdf_required {
            let vdf = submission.vdf.ok_or(ValidationError::MissingVdf)?;
            let expected = expected_vdf_seed(&tip_hash, next);
            if vdf.seed != expected {
                return Err(ValidationError::from(VdfError::SeedMismatch {
                    expected,
                    got: vdf.seed,
                })
                .into());
            }
            chain.vdf_verifier.verify(&vdf).map_err(ValidationError::from)?;
            (vdf_challenge(&vdf.output, next), Some(vdf))
        } else {
            (chain.challenge, None)
        };

        let difficulty = chain.consensus.difficulty;
        verify_proof(&submission.proof, &challenge, difficulty).map_err(ValidationError::from)?;

        let coinbase = Transaction::coinbase(submission.farmer_addr, block_reward(), next);
        chain.world.apply_tx(&coinbase)?;
        let mut txs = vec![coinbase];

        let max_user_txs = (BLOCK_GAS_LIMIT / TRANSFER_GAS) as usize;
        let mut overflow = Vec::new();
        for tx in self.mempool.drain() {
            if txs.len() > max_user_txs {
                overflow.push(tx);
                continue;
            }
            match chain.world.apply_tx(&tx) {
                Ok(()) => txs.push(tx),
                Err(e) => debug!("[block] dropping tx {}: {}", tx.hash(), e),
            }
        }
        if !overflow.is_empty() {
            self.mempool.requeue(overflow);
        }

        let timestamp = now_unix().max(tip.timestamp_unix);
        let ctx = BlockContext {
            height: next,
            timestamp,
            farmer: submission.farmer_addr,
            gas_limit: BLOCK_GAS_LIMIT,
        };
        let outcome = self.engine.execute(&tip.state_root, &ctx, &chain.world, &txs);
        let block = Block {
            height: next,
            timestamp_unix: timestamp,
            prev_hash: tip_hash,
            difficulty,
            challenge,
            proof: Some(submission.proof),
            farmer_addr: submission.farmer_addr,
            cumulative_work: chain.consensus.cumulative_work(tip.cumulative_work, difficulty),
            state_root: outcome.state_root,
            receipts_root: outcome.receipts_root,
            gas_used: outcome.gas_used,
            gas_limit: BLOCK_GAS_LIMIT,
            txs,
            vdf_seed: vdf.map(|v| v.seed),
            vdf_iterations: vdf.map_or(0, |v| v.iterations),
            vdf_output: vdf.map(|v| v.output),
        };

        let user_txs = block.user_txs().to_vec();
        let result = self.commit_block(&mut chain, block, outcome.receipts);
        if result.is_err() {
            self.mempool.requeue(user_txs);
        }
        result
    }

    /// Validate a peer block against the tip and commit it
    pub fn apply_peer_block(&self, block: Block) -> Result<AcceptedBlock, NodeError> {
        if self.is_halted() {
            return Err(NodeError::Halted);
        }
        let mut chain = self.chain.write();
        let tip_hash = chain.tip_hash();
        check_link(&block, chain.tip_height(), &tip_hash)?;
        let receipts = self.validate_and_apply(&mut chain, &block)?;
        self.commit_block(&mut chain, block, receipts)
    }

    /// Run every consensus check and apply the block's transactions
    ///
    /// The block must already link to `chain`'s tip. On error the world
    /// state is left as it was.
    fn validate_and_apply(&self, chain: &mut ChainState, block: &Block) -> Result<Vec<Receipt>, NodeError> {
        let (parent_work, parent_root) = {
            let parent = chain.tip();
            (parent.cumulative_work, parent.state_root)
        };

        if self.config.vdf_required {
            let mut verifier = VdfVerifier::new(self.config.max_block_vdf_iterations);
            check_vdf(block, &mut verifier)?;
        } else {
            check_proof(block, &expected_challenge(&block.prev_hash, block.height))?;
        }

        if block.difficulty != chain.consensus.difficulty {
            return Err(ValidationError::DifficultyMismatch {
                expected: chain.consensus.difficulty,
                got: block.difficulty,
            }
            .into());
        }
        let work = chain.consensus.cumulative_work(parent_work, block.difficulty);
        if block.cumulative_work != work {
            return Err(ValidationError::WorkMismatch {
                expected: work,
                got: block.cumulative_work,
            }
            .into());
        }
        check_coinbase(block, block_reward())?;
        check_signatures(block)?;
        if block.gas_used > block.gas_limit {
            return Err(ValidationError::GasLimitExceeded {
                used: block.gas_used,
                limit: block.gas_limit,
            }
            .into());
        }

        for (index, tx) in block.txs.iter().enumerate() {
            if let Err(source) = chain.world.apply_tx(tx) {
                chain.world.revert_block(&block.txs[..index]);
                return Err(ValidationError::InvalidTransaction { index, source }.into());
            }
        }

        let ctx = BlockContext {
            height: block.height,
            timestamp: block.timestamp_unix,
            farmer: block.farmer_addr,
            gas_limit: block.gas_limit,
        };
        let outcome = self.engine.execute(&parent_root, &ctx, &chain.world, &block.txs);
        let mismatch = if outcome.state_root != block.state_root {
            Some(ValidationError::StateRootMismatch)
        } else if outcome.receipts_root != block.receipts_root {
            Some(ValidationError::ReceiptsRootMismatch)
        } else {
            None
        };
        if let Some(err) = mismatch {
            chain.world.revert_block(&block.txs);
            return Err(err.into());
        }
        Ok(outcome.receipts)
    }

    /// Persist an applied block and advance the in-memory tip
    fn commit_block(
        &self,
        chain: &mut ChainState,
        block: Block,
        receipts: Vec<Receipt>,
    ) -> Result<AcceptedBlock, NodeError> {
        let height = block.height;
        let hash = block.hash();
        let txs = block.txs.len();

        chain.blocks.push(block);
        let mut consensus = chain.consensus.clone();
        let window = chain.retarget_window(height);
        if let Some(d) = consensus.on_block_accepted(height, &window) {
            info!("[consensus] retarget at height {}: {} -> {}", height, chain.consensus.difficulty, d);
        }

        let last = chain.blocks.len() - 1;
        let addrs = touched(&[&chain.blocks[last]]);
        let persisted = self.db.commit(&ChainCommit {
            blocks: &chain.blocks[last..],
            accounts: account_writes(&chain.world, &addrs),
            receipts: &receipts,
            tip_height: height,
            difficulty: consensus.difficulty,
            ..Default::default()
        });
        if let Err(e) = self.record_storage_result(persisted) {
            if let Some(block) = chain.blocks.pop() {
                chain.world.revert_block(&block.txs);
            }
            return Err(e);
        }

        chain.consensus = consensus;
        chain.reset_challenge();
        if let Some(vdf) = chain.vdf {
            if let Err(e) = self.db.save_vdf_state(&vdf) {
                warn!("[vdf] failed to persist reset state: {}", e);
            }
        }
        self.mempool.remove_included(&chain.blocks[last].txs);

        self.metrics.blocks_total.inc();
        self.metrics.tip_height.set(height);
        self.metrics.difficulty.set(chain.consensus.difficulty);
        self.metrics.mempool_size.set(self.mempool.len() as u64);
        self.watchdog.touch("archivas_tip_height");
        info!("[block] accepted height={} hash={} txs={}", height, hash, txs);

        Ok(AcceptedBlock {
            height,
            hash,
            txs,
            difficulty: chain.consensus.difficulty,
        })
    }

    /// Replace the chain above the branch's parent with `branch`
    ///
    /// The branch must be consecutive and its parent must be on our chain.
    /// Fork choice and depth are decided by the reorg detector; any block
    /// that fails validation restores the original chain.
    pub fn import_branch(&self, branch: Vec<Block>) -> Result<ReorgInfo, NodeError> {
        if self.is_halted() {
            return Err(NodeError::Halted);
        }
        let first = branch.first().ok_or(NodeError::UnknownFork)?;
        for pair in branch.windows(2) {
            check_link(&pair[1], pair[0].height, &pair[0].hash())?;
        }
        let common = first.height.checked_sub(1).ok_or(NodeError::UnknownFork)?;
        let branch_work = branch.last().map_or(0, |b| b.cumulative_work);

        let mut chain = self.chain.write();
        if chain.block_hash_at(common) != Some(first.prev_hash) {
            return Err(NodeError::UnknownFork);
        }
        let old_tip = chain.chain_tip();
        if let Err(e) = self.reorg.evaluate(old_tip.height, old_tip.cumulative_work, common, branch_work) {
            warn!(
                "[reorg] refusing branch at fork {} (tip {}, branch tip {}): {}",
                common,
                old_tip.height,
                branch.last().map_or(common, |b| b.height),
                e
            );
            return Err(e.into());
        }

        let params = chain.consensus.params.clone();
        let removed = chain.blocks.split_off(common as usize + 1);
        for block in removed.iter().rev() {
            chain.world.revert_block(&block.txs);
        }
        chain.consensus.difficulty = difficulty_after(&chain.blocks, common, &params);

        let mut receipts = Vec::new();
        for block in &branch {
            match self.validate_and_apply(&mut chain, block) {
                Ok(r) => {
                    receipts.extend(r);
                    chain.blocks.push(block.clone());
                    chain.consensus.difficulty = difficulty_after(&chain.blocks, block.height, &params);
                }
                Err(e) => {
                    warn!("[reorg] branch block {} invalid: {}", block.height, e);
                    restore_chain(&mut chain, common, removed, old_tip.difficulty);
                    return Err(e);
                }
            }
        }

        let all: Vec<&Block> = removed.iter().chain(branch.iter()).collect();
        let addrs = touched(&all);
        let persisted = self.db.commit(&ChainCommit {
            blocks: &branch,
            truncate_above: Some(common),
            accounts: account_writes(&chain.world, &addrs),
            receipts: &receipts,
            removed_txs: removed.iter().flat_map(|b| b.txs.iter().map(Transaction::hash)).collect(),
            tip_height: chain.tip_height(),
            difficulty: chain.consensus.difficulty,
        });
        if let Err(e) = self.record_storage_result(persisted) {
            restore_chain(&mut chain, common, removed, old_tip.difficulty);
            return Err(e);
        }

        chain.reset_challenge();
        for block in &branch {
            self.mempool.remove_included(&block.txs);
        }
        // transactions only the abandoned branch carried go back to the pool
        let included: BTreeSet<Hash> = branch.iter().flat_map(|b| b.txs.iter().map(Transaction::hash)).collect();
        for tx in removed.iter().flat_map(|b| b.user_txs().iter()) {
            if !included.contains(&tx.hash()) {
                if let Err(e) = self.mempool.add(tx.clone(), &chain.world) {
                    debug!("[reorg] dropping abandoned tx {}: {}", tx.hash(), e);
                }
            }
        }

        let info = ReorgInfo::new(common, old_tip.height, chain.tip_height());
        self.metrics.tip_height.set(info.new_tip_height);
        self.metrics.difficulty.set(chain.consensus.difficulty);
        self.metrics.blocks_total.add(info.blocks_added);
        self.watchdog.touch("archivas_tip_height");
        warn!(
            "[reorg] switched branch at fork {}: -{} +{} (tip {} -> {})",
            info.fork_height, info.blocks_removed, info.blocks_added, info.old_tip_height, info.new_tip_height
        );
        Ok(info)
    }

    /// Accept a timelord VDF point for the current tip
    pub fn update_vdf(&self, update: VdfState) -> Result<ChallengeSnapshot, NodeError> {
        if !self.config.vdf_required {
            return Err(NodeError::VdfDisabled);
        }
        let mut chain = self.chain.write();
        let expected = chain.expected_vdf_seed();
        if update.seed != expected {
            return Err(ValidationError::from(VdfError::SeedMismatch {
                expected,
                got: update.seed,
            })
            .into());
        }
        if chain.vdf.map_or(false, |cur| update.iterations < cur.iterations) {
            // stale update; keep the challenge moving forward only
            return Ok(chain.snapshot());
        }
        chain.vdf_verifier.verify(&update).map_err(ValidationError::from)?;

        let next = chain.tip_height() + 1;
        chain.vdf = Some(update);
        chain.challenge = vdf_challenge(&update.output, next);
        if let Err(e) = self.db.save_vdf_state(&update) {
            warn!("[vdf] failed to persist state: {}", e);
        }
        self.metrics.vdf_updates.inc();
        self.watchdog.touch("archivas_vdf_updates_total");
        debug!("[vdf] iterations={} challenge={}", update.iterations, chain.challenge);
        Ok(chain.snapshot())
    }

    /// Verify and queue a user transaction
    pub fn submit_tx(&self, tx: Transaction) -> Result<Hash, NodeError> {
        tx.verify()?;
        let chain = self.chain.read();
        let hash = self.mempool.add(tx, &chain.world)?;
        self.metrics.mempool_size.set(self.mempool.len() as u64);
        debug!("[mempool] queued {}", hash);
        Ok(hash)
    }

    pub fn submit_legacy_tx(&self, tx: LegacyTx) -> Result<Hash, NodeError> {
        self.submit_tx(Transaction::Transfer(tx))
    }

    pub fn submit_v1_tx(&self, tx: SignedTx) -> Result<Hash, NodeError> {
        self.submit_tx(Transaction::V1(tx))
    }
}

/// Undo a partially imported branch and put `removed` back on top of `common`
fn restore_chain(chain: &mut ChainState, common: u64, removed: Vec<Block>, difficulty: u64) {
    while chain.tip_height() > common {
        if let Some(block) = chain.blocks.pop() {
            chain.world.revert_block(&block.txs);
        }
    }
    for block in removed {
        for tx in &block.txs {
            if let Err(e) = chain.world.apply_tx(tx) {
                warn!("[reorg] restoring block {}: {}", block.height, e);
            }
        }
        chain.blocks.push(block);
    }
    chain.consensus.difficulty = difficulty;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{GenesisAlloc, NodeConfig};
    use crate::crypto::PrivateKey;
    use crate::vdf::{compute, seed_for_tip};
    use std::path::Path;

    pub fn test_config(dir: &Path, vdf_required: bool) -> NodeConfig {
        let mut cfg = NodeConfig::devnet(dir.join("db"));
        cfg.genesis.initial_difficulty = u64::MAX;
        cfg.consensus.initial_difficulty = u64::MAX;
        cfg.consensus.retarget_interval = 0;
        cfg.vdf_required = vdf_required;
        cfg.enable_p2p = false;
        cfg.genesis.allocations.push(GenesisAlloc {
            address: funded_key().public_key().legacy_address().to_hex(),
            amount: 1_000_000,
        });
        cfg
    }

    pub fn funded_key() -> PrivateKey {
        PrivateKey::from_bytes(&[0x42; 32]).unwrap()
    }

    pub fn farm(node: &Node, farmer: Address) -> Result<AcceptedBlock, NodeError> {
        let snap = node.challenge();
        let key = PrivateKey::from_bytes(&[7; 32]).unwrap().public_key();
        node.submit_block(BlockSubmission {
            proof: Proof::from_entry(snap.challenge, key, 0),
            farmer_addr: farmer,
            vdf: snap.vdf,
        })
    }

    #[test]
    fn test_local_block_pays_coinbase() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(dir.path(), false)).unwrap();
        let farmer = Address([9; 20]);

        let accepted = farm(&node, farmer).unwrap();
        assert_eq!(accepted.height, 1);
        assert_eq!(node.height(), 1);
        assert_eq!(node.account(&farmer).unwrap().balance, 2_000_000_000);
        assert_eq!(node.challenge().height, 2);
        assert_eq!(node.db().tip_height().unwrap(), Some(1));
        assert_eq!(node.metrics().submit_accepted.get(), 1);
    }

    #[test]
    fn test_coinbases_at_different_heights_hash_apart() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(dir.path(), false)).unwrap();
        let farmer = Address([9; 20]);
        farm(&node, farmer).unwrap();
        farm(&node, farmer).unwrap();

        let blocks = node.recent_blocks(2);
        let (second, first) = (&blocks[0], &blocks[1]);
        assert!(matches!(first.txs[0], Transaction::Coinbase { height: 1, .. }));
        assert!(matches!(second.txs[0], Transaction::Coinbase { height: 2, .. }));
        assert_ne!(first.txs[0].hash(), second.txs[0].hash());
        assert_eq!(node.account(&farmer).unwrap().balance, (2 * block_reward()) as i64);
    }

    #[test]
    fn test_proof_for_stale_challenge_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(dir.path(), false)).unwrap();
        let key = PrivateKey::from_bytes(&[7; 32]).unwrap().public_key();
        let err = node
            .submit_block(BlockSubmission {
                proof: Proof::from_entry(Hash([5; 32]), key, 0),
                farmer_addr: Address([9; 20]),
                vdf: None,
            })
            .unwrap_err();
        assert!(matches!(err, NodeError::Validation(ValidationError::InvalidProof(_))));
        assert_eq!(node.height(), 0);
        assert_eq!(node.metrics().submit_ignored.get(), 1);
    }

    #[test]
    fn test_transfer_included_and_nonce_advances() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(dir.path(), false)).unwrap();
        let key = funded_key();
        let from = key.public_key().legacy_address();
        let to = Address([3; 20]);

        node.submit_legacy_tx(LegacyTx::signed(&key, to, 1_000, 10, 0).unwrap()).unwrap();
        let accepted = farm(&node, Address([9; 20])).unwrap();
        assert_eq!(accepted.txs, 2);
        assert_eq!(node.account(&to).unwrap().balance, 1_000);
        let sender = node.account(&from).unwrap();
        assert_eq!(sender, Account { balance: 1_000_000 - 1_010, nonce: 1 });
        assert!(node.mempool().is_empty());

        let tx_hash = node.block(1).unwrap().txs[1].hash();
        assert_eq!(node.receipt(&tx_hash).unwrap().unwrap().status, 1);
    }

    #[test]
    fn test_peer_blocks_replicate_state() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Node::open(test_config(a_dir.path(), false)).unwrap();
        let b = Node::open(test_config(b_dir.path(), false)).unwrap();

        let key = funded_key();
        a.submit_legacy_tx(LegacyTx::signed(&key, Address([3; 20]), 500, 5, 0).unwrap()).unwrap();
        farm(&a, Address([9; 20])).unwrap();
        farm(&a, Address([9; 20])).unwrap();

        for h in 1..=2 {
            b.apply_peer_block(a.block(h).unwrap()).unwrap();
        }
        assert_eq!(b.tip(), a.tip());
        assert_eq!(b.account(&Address([3; 20])), a.account(&Address([3; 20])));

        // replaying an applied block fails the link check
        let err = b.apply_peer_block(a.block(2).unwrap()).unwrap_err();
        assert!(matches!(err, NodeError::Validation(ValidationError::HeightMismatch { .. })));
    }

    #[test]
    fn test_tampered_peer_block_rejected_without_side_effects() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Node::open(test_config(a_dir.path(), false)).unwrap();
        let b = Node::open(test_config(b_dir.path(), false)).unwrap();
        farm(&a, Address([9; 20])).unwrap();

        let mut block = a.block(1).unwrap();
        block.txs[0] = Transaction::coinbase(Address([9; 20]), block_reward() + 1, block.height);
        assert!(matches!(
            b.apply_peer_block(block).unwrap_err(),
            NodeError::Validation(ValidationError::BadCoinbase(_))
        ));

        let mut block = a.block(1).unwrap();
        block.state_root = Hash([1; 32]);
        assert!(matches!(
            b.apply_peer_block(block).unwrap_err(),
            NodeError::Validation(ValidationError::StateRootMismatch)
        ));
        assert!(b.account(&Address([9; 20])).is_none());
        assert_eq!(b.height(), 0);
    }

    #[test]
    fn test_heavier_branch_reorgs_and_returns_txs() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Node::open(test_config(a_dir.path(), false)).unwrap();
        let b = Node::open(test_config(b_dir.path(), false)).unwrap();

        for _ in 0..3 {
            farm(&a, Address([1; 20])).unwrap();
        }
        let key = funded_key();
        b.submit_legacy_tx(LegacyTx::signed(&key, Address([3; 20]), 700, 1, 0).unwrap()).unwrap();
        farm(&b, Address([2; 20])).unwrap();
        farm(&b, Address([2; 20])).unwrap();

        let branch: Vec<Block> = (1..=3).map(|h| a.block(h).unwrap()).collect();
        let info = b.import_branch(branch).unwrap();
        assert_eq!(info, ReorgInfo::new(0, 2, 3));
        assert_eq!(b.tip(), a.tip());
        assert!(b.account(&Address([2; 20])).is_none());
        assert_eq!(b.account(&Address([1; 20])).unwrap().balance, 3 * 2_000_000_000);
        // the abandoned transfer is pending again
        assert_eq!(b.mempool().len(), 1);
        assert_eq!(b.db().tip_height().unwrap(), Some(3));
        assert_eq!(b.db().get_block(3).unwrap().unwrap().hash(), a.tip().hash);
    }

    #[test]
    fn test_reorg_drops_abandoned_tx_with_spent_nonce() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Node::open(test_config(a_dir.path(), false)).unwrap();
        let b = Node::open(test_config(b_dir.path(), false)).unwrap();
        let key = funded_key();

        // both branches spend nonce 0, with different transfers
        a.submit_legacy_tx(LegacyTx::signed(&key, Address([4; 20]), 100, 1, 0).unwrap()).unwrap();
        for _ in 0..3 {
            farm(&a, Address([1; 20])).unwrap();
        }
        b.submit_legacy_tx(LegacyTx::signed(&key, Address([3; 20]), 700, 1, 0).unwrap()).unwrap();
        farm(&b, Address([2; 20])).unwrap();

        let branch: Vec<Block> = (1..=3).map(|h| a.block(h).unwrap()).collect();
        b.import_branch(branch).unwrap();
        assert_eq!(b.tip(), a.tip());
        assert!(b.mempool().is_empty());
        assert!(b.account(&Address([3; 20])).is_none());
        assert_eq!(b.account(&Address([4; 20])).unwrap().balance, 100);
    }

    #[test]
    fn test_lighter_branch_refused() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Node::open(test_config(a_dir.path(), false)).unwrap();
        let b = Node::open(test_config(b_dir.path(), false)).unwrap();
        farm(&a, Address([1; 20])).unwrap();
        farm(&b, Address([2; 20])).unwrap();
        farm(&b, Address([2; 20])).unwrap();

        let before = b.tip();
        let err = b.import_branch(vec![a.block(1).unwrap()]).unwrap_err();
        assert!(matches!(err, NodeError::Validation(ValidationError::InsufficientWork)));
        assert_eq!(b.tip(), before);
    }

    #[test]
    fn test_vdf_gating() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(dir.path(), true)).unwrap();
        let tip = node.tip();
        let seed = seed_for_tip(&tip.hash, tip.height);

        let bad = VdfState { seed, iterations: 50, output: Hash([0xAB; 32]) };
        assert!(matches!(
            node.update_vdf(bad),
            Err(NodeError::Validation(ValidationError::VdfVerifyFailed(_)))
        ));

        let good = VdfState { seed, iterations: 50, output: compute(&seed, 50) };
        let snap = node.update_vdf(good).unwrap();
        assert_eq!(snap.challenge, vdf_challenge(&good.output, 1));
        assert_eq!(farm(&node, Address([9; 20])).unwrap().height, 1);
        assert_eq!(node.block(1).unwrap().vdf_iterations, 50);
    }

    #[test]
    fn test_peer_block_with_oversized_vdf_rejected_quickly() {
        let a_dir = tempfile::tempdir().unwrap();
        let b_dir = tempfile::tempdir().unwrap();
        let a = Node::open(test_config(a_dir.path(), true)).unwrap();
        let b = Node::open(test_config(b_dir.path(), true)).unwrap();

        let tip = a.tip();
        let seed = seed_for_tip(&tip.hash, tip.height);
        a.update_vdf(VdfState { seed, iterations: 50, output: compute(&seed, 50) }).unwrap();
        farm(&a, Address([9; 20])).unwrap();

        let mut block = a.block(1).unwrap();
        block.vdf_iterations = u64::MAX;
        let started = std::time::Instant::now();
        let err = b.apply_peer_block(block).unwrap_err();
        assert!(matches!(
            err,
            NodeError::Validation(ValidationError::VdfVerifyFailed(VdfError::DeltaTooLarge { .. }))
        ));
        assert!(started.elapsed() < std::time::Duration::from_secs(1));
        assert_eq!(b.height(), 0);

        // the untouched block still applies
        b.apply_peer_block(a.block(1).unwrap()).unwrap();
        assert_eq!(b.tip(), a.tip());
    }

    #[test]
    fn test_vdf_update_refused_without_vdf_mode() {
        let dir = tempfile::tempdir().unwrap();
        let node = Node::open(test_config(dir.path(), false)).unwrap();
        let state = VdfState::at_seed(Hash([1; 32]));
        assert!(matches!(node.update_vdf(state), Err(NodeError::VdfDisabled)));
    }
}
