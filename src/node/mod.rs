//! Node core: chain state, block pipeline and bootstrap
//!
//! `Node` is the explicit context every subsystem receives. The P2P layer,
//! the IBD driver and the RPC server only see it through the capability
//! traits in [`traits`].

mod genesis;
mod pipeline;
mod state;
pub mod traits;

pub use pipeline::*;
pub use state::*;
pub use traits::*;

#[cfg(test)]
pub(crate) use pipeline::tests as test_support;

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{Block, ReorgDetector, ValidationError};
use crate::crypto::{Address, Hash};
use crate::ledger::{Account, ExecutionEngine, Receipt, TransferEngine, TxError};
use crate::mempool::{Mempool, MempoolError};
use crate::metrics::{Metrics, Watchdog};
use crate::storage::{ChainDb, StorageError};

/// Consecutive persist failures after which the node stops accepting blocks
const MAX_STORAGE_FAILURES: u32 = 3;

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Mempool(#[from] MempoolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database belongs to genesis {stored}, configured genesis is {configured}")]
    GenesisMismatch { stored: Hash, configured: Hash },
    #[error("vdf updates are not accepted: node runs without --vdf-required")]
    VdfDisabled,
    #[error("branch does not connect to the local chain")]
    UnknownFork,
    #[error("block pipeline halted after repeated storage failures")]
    Halted,
}

/// Receives `NewBlock` announcements after the pipeline lock is released
pub trait BlockBroadcaster: Send + Sync {
    fn broadcast_new_block(&self, height: u64, hash: Hash);
}

/// Running node
pub struct Node {
    config: NodeConfig,
    chain: RwLock<ChainState>,
    mempool: Mempool,
    db: ChainDb,
    metrics: Arc<Metrics>,
    watchdog: Arc<Watchdog>,
    engine: Box<dyn ExecutionEngine>,
    reorg: ReorgDetector,
    broadcaster: RwLock<Option<Arc<dyn BlockBroadcaster>>>,
    genesis_hash: Hash,
    storage_failures: AtomicU32,
    halted: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("genesis_hash", &self.genesis_hash)
            .field("tip", &self.chain.read().chain_tip())
            .finish()
    }
}

impl Node {
    /// Open the database and bring the chain up (genesis or replay)
    pub fn open(config: NodeConfig) -> Result<Self, NodeError> {
        Self::open_with_engine(config, Box::new(TransferEngine))
    }

    pub fn open_with_engine(
        config: NodeConfig,
        engine: Box<dyn ExecutionEngine>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let db = ChainDb::open(&config.db_path)?;
        let genesis_hash = config.genesis.hash();
        let chain = genesis::bootstrap(&config, &db)?;

        let metrics = Arc::new(Metrics::new());
        let tip = chain.chain_tip();
        metrics.tip_height.set(tip.height);
        metrics.difficulty.set(tip.difficulty);
        let watchdog = Arc::new(Watchdog::new("node", metrics.clone()));
        let tip_threshold = Duration::from_secs(10 * config.consensus.target_block_secs.max(1));
        watchdog.register("archivas_tip_height", tip_threshold);
        if config.vdf_required {
            watchdog.register("archivas_vdf_updates_total", Duration::from_secs(60));
        }

        Ok(Self {
            config,
            chain: RwLock::new(chain),
            mempool: Mempool::default(),
            db,
            metrics,
            watchdog,
            engine,
            reorg: ReorgDetector::default(),
            broadcaster: RwLock::new(None),
            genesis_hash,
            storage_failures: AtomicU32::new(0),
            halted: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn watchdog(&self) -> &Arc<Watchdog> {
        &self.watchdog
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    pub fn db(&self) -> &ChainDb {
        &self.db
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    pub fn set_broadcaster(&self, broadcaster: Arc<dyn BlockBroadcaster>) {
        *self.broadcaster.write() = Some(broadcaster);
    }

    pub fn tip(&self) -> ChainTip {
        self.chain.read().chain_tip()
    }

    pub fn height(&self) -> u64 {
        self.chain.read().tip_height()
    }

    pub fn challenge(&self) -> ChallengeSnapshot {
        self.chain.read().snapshot()
    }

    pub fn account(&self, addr: &Address) -> Option<Account> {
        self.chain.read().world.get(addr).copied()
    }

    pub fn block(&self, height: u64) -> Option<Block> {
        self.chain.read().blocks.get(height as usize).cloned()
    }

    /// Up to `limit` blocks from `from`, capped at the range maximum
    pub fn blocks_range(&self, from: u64, limit: u32) -> Vec<Block> {
        let limit = limit.min(crate::constants::MAX_BLOCKS_PER_BATCH) as usize;
        let chain = self.chain.read();
        chain
            .blocks
            .iter()
            .skip(from as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest `count` blocks, newest first
    pub fn recent_blocks(&self, count: usize) -> Vec<Block> {
        self.chain.read().blocks.iter().rev().take(count).cloned().collect()
    }

    pub fn receipt(&self, hash: &Hash) -> Result<Option<Receipt>, NodeError> {
        Ok(self.db.get_receipt(hash)?)
    }

    /// Flush storage; call once on shutdown
    pub fn close(&self) -> Result<(), NodeError> {
        Ok(self.db.close()?)
    }

    fn broadcast(&self, height: u64, hash: Hash) {
        if let Some(b) = self.broadcaster.read().as_ref() {
            b.broadcast_new_block(height, hash);
        }
    }

    fn record_storage_result<T>(&self, result: Result<T, StorageError>) -> Result<T, NodeError> {
        match result {
            Ok(v) => {
                self.storage_failures.store(0, Ordering::Relaxed);
                Ok(v)
            }
            Err(e) => {
                let failures = self.storage_failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::error!("[storage] persist failed ({} in a row): {}", failures, e);
                if failures >= MAX_STORAGE_FAILURES {
                    self.halted.store(true, Ordering::Relaxed);
                    tracing::error!("[storage] halting block pipeline");
                }
                Err(e.into())
            }
        }
    }
}
