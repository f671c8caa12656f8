//! Chain bootstrap: genesis initialization or replay of a stored chain

use tracing::{info, warn};

use super::state::{difficulty_after, ChainState};
use super::NodeError;
use crate::config::NodeConfig;
use crate::consensus::{vdf_challenge, Block, Consensus};
use crate::ledger::{state_root, WorldState};
use crate::storage::{ChainCommit, ChainDb, StorageError};

/// Build the in-memory chain from `db`, initializing it from genesis if empty
pub(super) fn bootstrap(config: &NodeConfig, db: &ChainDb) -> Result<ChainState, NodeError> {
    let configured = config.genesis.hash();
    let consensus = Consensus::new(config.consensus.clone());

    let tip = match db.tip_height()? {
        None => return init_genesis(config, db, consensus),
        Some(tip) => tip,
    };

    match db.genesis_hash()? {
        Some(stored) if stored != configured => {
            return Err(NodeError::GenesisMismatch { stored, configured });
        }
        Some(_) => {}
        None => {
            warn!("[genesis] database has no genesis record, adopting {}", configured);
            db.save_identity(&configured, config.network.network_id)?;
        }
    }

    let blocks = load_chain(db, tip)?;
    let mut world = config.genesis.world_state()?;
    let expected_genesis = config.genesis.block(&world);
    if blocks[0].hash() != expected_genesis.hash() {
        return Err(StorageError::Corrupt {
            key: "blk:0".into(),
            reason: "stored genesis block differs from configured genesis".into(),
        }
        .into());
    }

    for block in &blocks[1..] {
        for tx in &block.txs {
            world.apply_tx(tx).map_err(|e| StorageError::Corrupt {
                key: format!("blk:{}", block.height),
                reason: format!("replay failed: {}", e),
            })?;
        }
    }

    let tip_block = &blocks[blocks.len() - 1];
    if state_root(&world) != tip_block.state_root {
        warn!("[storage] replayed state root differs from tip block, loading persisted accounts");
        world = WorldState::new();
        for (addr, account) in db.load_accounts()? {
            world.insert(addr, account);
        }
    }

    let mut consensus = consensus;
    let replayed = difficulty_after(&blocks, tip, &consensus.params);
    consensus.difficulty = match db.difficulty()? {
        Some(stored) if stored != replayed => {
            warn!(
                "[consensus] replayed difficulty {} differs from stored {}, keeping stored",
                replayed, stored
            );
            stored
        }
        Some(stored) => stored,
        None => replayed,
    };

    let mut chain = ChainState::new(blocks, world, consensus, config.vdf_required);
    if config.vdf_required {
        if let Some(saved) = db.load_vdf_state()? {
            if saved.seed == chain.expected_vdf_seed() {
                chain.challenge = vdf_challenge(&saved.output, tip + 1);
                chain.vdf = Some(saved);
            }
        }
    }
    info!(
        "[storage] replayed {} blocks, tip {} difficulty {}",
        tip + 1,
        tip,
        chain.consensus.difficulty
    );
    Ok(chain)
}

fn init_genesis(config: &NodeConfig, db: &ChainDb, consensus: Consensus) -> Result<ChainState, NodeError> {
    let world = config.genesis.world_state()?;
    let block = config.genesis.block(&world);
    let accounts = world.iter().map(|(a, acc)| (*a, Some(*acc))).collect();
    let blocks = vec![block];

    db.commit(&ChainCommit {
        blocks: &blocks,
        accounts,
        tip_height: 0,
        difficulty: consensus.difficulty,
        ..Default::default()
    })?;
    let genesis_hash = config.genesis.hash();
    db.save_identity(&genesis_hash, config.network.network_id)?;
    info!(
        "[genesis] initialized {} ({} allocations) hash {}",
        config.genesis.chain_name,
        world.len(),
        genesis_hash
    );
    Ok(ChainState::new(blocks, world, consensus, config.vdf_required))
}

fn load_chain(db: &ChainDb, tip: u64) -> Result<Vec<Block>, NodeError> {
    let mut blocks: Vec<Block> = Vec::with_capacity(tip as usize + 1);
    while (blocks.len() as u64) <= tip {
        let from = blocks.len() as u64;
        let batch = db.get_blocks_range(from, crate::constants::MAX_BLOCKS_PER_BATCH)?;
        if batch.is_empty() {
            break;
        }
        for block in batch {
            if block.height != blocks.len() as u64 || block.height > tip {
                break;
            }
            blocks.push(block);
        }
        if blocks.len() as u64 == from {
            break;
        }
    }
    if blocks.len() as u64 != tip + 1 {
        return Err(StorageError::Corrupt {
            key: format!("blk:{}", blocks.len()),
            reason: format!("missing block below tip {}", tip),
        }
        .into());
    }
    Ok(blocks)
}
