//! Narrow capabilities handed to subsystems instead of the whole node

use super::{AcceptedBlock, ChainTip, ChallengeSnapshot, Node, NodeError};
use crate::consensus::{Block, ReorgInfo};
use crate::crypto::{Address, Hash};
use crate::ledger::{Account, LegacyTx, SignedTx};

/// Moves the tip with blocks that came from elsewhere
pub trait BlockImporter: Send + Sync {
    fn local_height(&self) -> u64;
    fn apply_peer_block(&self, block: Block) -> Result<AcceptedBlock, NodeError>;
    fn import_branch(&self, blocks: Vec<Block>) -> Result<ReorgInfo, NodeError>;
}

/// Read-only chain and account queries
pub trait StateReader: Send + Sync {
    fn account(&self, addr: &Address) -> Option<Account>;

    fn balance(&self, addr: &Address) -> i64 {
        self.account(addr).map_or(0, |a| a.balance)
    }

    fn chain_tip(&self) -> ChainTip;
    fn challenge_snapshot(&self) -> ChallengeSnapshot;
    fn block_at(&self, height: u64) -> Option<Block>;
    fn blocks_range(&self, from: u64, limit: u32) -> Vec<Block>;
}

/// Transaction ingest
pub trait TxSubmitter: Send + Sync {
    fn submit_legacy(&self, tx: LegacyTx) -> Result<Hash, NodeError>;
    fn submit_v1(&self, tx: SignedTx) -> Result<Hash, NodeError>;
}

impl BlockImporter for Node {
    fn local_height(&self) -> u64 {
        self.height()
    }

    fn apply_peer_block(&self, block: Block) -> Result<AcceptedBlock, NodeError> {
        Node::apply_peer_block(self, block)
    }

    fn import_branch(&self, blocks: Vec<Block>) -> Result<ReorgInfo, NodeError> {
        Node::import_branch(self, blocks)
    }
}

impl StateReader for Node {
    fn account(&self, addr: &Address) -> Option<Account> {
        Node::account(self, addr)
    }

    fn chain_tip(&self) -> ChainTip {
        self.tip()
    }

    fn challenge_snapshot(&self) -> ChallengeSnapshot {
        self.challenge()
    }

    fn block_at(&self, height: u64) -> Option<Block> {
        self.block(height)
    }

    fn blocks_range(&self, from: u64, limit: u32) -> Vec<Block> {
        Node::blocks_range(self, from, limit)
    }
}

impl TxSubmitter for Node {
    fn submit_legacy(&self, tx: LegacyTx) -> Result<Hash, NodeError> {
        self.submit_legacy_tx(tx)
    }

    fn submit_v1(&self, tx: SignedTx) -> Result<Hash, NodeError> {
        self.submit_v1_tx(tx)
    }
}
