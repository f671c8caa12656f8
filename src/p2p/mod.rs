//! P2P networking: handshake, block gossip, peer gossip and range sync

mod identity;
mod network;
mod peer;
mod protocol;
mod sync;

pub use identity::*;
pub use network::*;
pub use peer::*;
pub use protocol::*;
pub use sync::*;

use std::sync::Arc;
use thiserror::Error;

use crate::consensus::Block;
use crate::crypto::Hash;
use crate::node::{Node, NodeError};

/// P2P errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("connection closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("fork walk deeper than {0} blocks")]
    ReorgTooDeep(u64),
    #[error("block rejected: {0}")]
    Rejected(#[from] NodeError),
}

/// What the network layer needs from the chain
pub trait NodeHandler: Send + Sync + 'static {
    fn local_height(&self) -> u64;
    /// `(height, hash)` of the tip
    fn tip(&self) -> (u64, Hash);
    fn block_hash_at(&self, height: u64) -> Option<Hash>;
    fn block_at(&self, height: u64) -> Option<Block>;
    /// Up to `max` blocks from `from` and the current tip height
    fn blocks_range(&self, from: u64, max: u32) -> (Vec<Block>, u64);
    fn verify_and_apply_block(&self, block: Block) -> Result<(), NodeError>;
    fn import_branch(&self, blocks: Vec<Block>) -> Result<(), NodeError>;
}

/// `NodeHandler` over a running node
#[derive(Debug, Clone)]
pub struct NodeAdapter(pub Arc<Node>);

impl NodeHandler for NodeAdapter {
    fn local_height(&self) -> u64 {
        self.0.height()
    }

    fn tip(&self) -> (u64, Hash) {
        let tip = self.0.tip();
        (tip.height, tip.hash)
    }

    fn block_hash_at(&self, height: u64) -> Option<Hash> {
        self.0.block(height).map(|b| b.hash())
    }

    fn block_at(&self, height: u64) -> Option<Block> {
        self.0.block(height)
    }

    fn blocks_range(&self, from: u64, max: u32) -> (Vec<Block>, u64) {
        let blocks = self.0.blocks_range(from, max);
        (blocks, self.0.height())
    }

    fn verify_and_apply_block(&self, block: Block) -> Result<(), NodeError> {
        self.0.apply_peer_block(block).map(|_| ())
    }

    fn import_branch(&self, blocks: Vec<Block>) -> Result<(), NodeError> {
        self.0.import_branch(blocks).map(|_| ())
    }
}
