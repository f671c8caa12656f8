//! Durable key-value store using Sled
//!
//! One ordered tree with prefixed keys. `meta:tip_height` is the
//! consistency anchor: a block is committed once the tip points at it.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::consensus::Block;
use crate::constants::MAX_BLOCKS_PER_BATCH;
use crate::crypto::{Address, Hash};
use crate::ledger::{Account, Receipt};
use crate::vdf::VdfState;

const BLOCK_PREFIX: &[u8] = b"blk:";
const ACCOUNT_PREFIX: &[u8] = b"acc:";
const TX_PREFIX: &[u8] = b"tx:";
const PEER_PREFIX: &[u8] = b"peer:";

const TIP_HEIGHT_KEY: &[u8] = b"meta:tip_height";
const DIFFICULTY_KEY: &[u8] = b"meta:difficulty";
const VDF_SEED_KEY: &[u8] = b"meta:vdf_seed";
const VDF_ITERATIONS_KEY: &[u8] = b"meta:vdf_iterations";
const VDF_OUTPUT_KEY: &[u8] = b"meta:vdf_output";
const GENESIS_HASH_KEY: &[u8] = b"meta:genesis_hash";
const NETWORK_ID_KEY: &[u8] = b"meta:network_id";

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage write failed: {0}")]
    WriteFailed(#[from] sled::Error),
    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything one block (or one reorg) changes, written as a single batch
#[derive(Debug, Default)]
pub struct ChainCommit<'a> {
    pub blocks: &'a [Block],
    /// Delete `blk:` entries above this height before writing `blocks`
    pub truncate_above: Option<u64>,
    /// `None` deletes the account record
    pub accounts: Vec<(Address, Option<Account>)>,
    pub receipts: &'a [Receipt],
    pub removed_txs: Vec<Hash>,
    pub tip_height: u64,
    pub difficulty: u64,
}

/// Database wrapper
#[derive(Debug, Clone)]
pub struct ChainDb {
    db: Db,
}

fn block_key(height: u64) -> Vec<u8> {
    [BLOCK_PREFIX, &height.to_be_bytes()[..]].concat()
}

fn account_key(addr: &Address) -> Vec<u8> {
    [ACCOUNT_PREFIX, addr.to_hex().as_bytes()].concat()
}

fn tx_key(hash: &Hash) -> Vec<u8> {
    [TX_PREFIX, hash.to_hex().as_bytes()].concat()
}

fn peer_key(addr: &str) -> Vec<u8> {
    [PEER_PREFIX, addr.as_bytes()].concat()
}

fn corrupt(key: &[u8], reason: impl ToString) -> StorageError {
    StorageError::Corrupt {
        key: String::from_utf8_lossy(key).into_owned(),
        reason: reason.to_string(),
    }
}

fn decode_u64(key: &[u8], bytes: &[u8]) -> Result<u64, StorageError> {
    let arr: [u8; 8] = bytes.try_into().map_err(|_| corrupt(key, "expected 8 bytes"))?;
    Ok(u64::from_be_bytes(arr))
}

fn decode_hash(key: &[u8], bytes: &[u8]) -> Result<Hash, StorageError> {
    Hash::from_slice(bytes).ok_or_else(|| corrupt(key, "expected 32 bytes"))
}

impl ChainDb {
    /// Open or create the database; sled holds an exclusive lock on the path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// In-memory database for tests
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, StorageError> {
        self.db
            .get(key)?
            .map(|v| decode_u64(key, &v))
            .transpose()
    }

    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        self.db
            .get(key)?
            .map(|v| serde_json::from_slice(&v).map_err(|e| corrupt(key, e)))
            .transpose()
    }

    pub fn tip_height(&self) -> Result<Option<u64>, StorageError> {
        self.get_u64(TIP_HEIGHT_KEY)
    }

    pub fn difficulty(&self) -> Result<Option<u64>, StorageError> {
        self.get_u64(DIFFICULTY_KEY)
    }

    pub fn get_block(&self, height: u64) -> Result<Option<Block>, StorageError> {
        self.get_json(&block_key(height))
    }

    /// Up to `limit` (capped at 512) consecutive blocks starting at `from`
    pub fn get_blocks_range(&self, from: u64, limit: u32) -> Result<Vec<Block>, StorageError> {
        let limit = limit.min(MAX_BLOCKS_PER_BATCH) as usize;
        let mut blocks = Vec::with_capacity(limit);
        for item in self.db.range(block_key(from)..).take(limit) {
            let (key, value) = item?;
            if !key.starts_with(BLOCK_PREFIX) {
                break;
            }
            blocks.push(serde_json::from_slice(&value).map_err(|e| corrupt(&key, e))?);
        }
        Ok(blocks)
    }

    pub fn get_account(&self, addr: &Address) -> Result<Option<Account>, StorageError> {
        self.get_json(&account_key(addr))
    }

    /// All persisted accounts
    pub fn load_accounts(&self) -> Result<Vec<(Address, Account)>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(ACCOUNT_PREFIX) {
            let (key, value) = item?;
            let addr_str = std::str::from_utf8(&key[ACCOUNT_PREFIX.len()..])
                .map_err(|e| corrupt(&key, e))?;
            let addr = Address::parse(addr_str).map_err(|e| corrupt(&key, e))?;
            let account = serde_json::from_slice(&value).map_err(|e| corrupt(&key, e))?;
            out.push((addr, account));
        }
        Ok(out)
    }

    pub fn get_receipt(&self, hash: &Hash) -> Result<Option<Receipt>, StorageError> {
        self.get_json(&tx_key(hash))
    }

    /// Write a block or reorg atomically, then flush
    pub fn commit(&self, commit: &ChainCommit<'_>) -> Result<(), StorageError> {
        let mut batch = Batch::default();

        if let Some(height) = commit.truncate_above {
            for item in self.db.range(block_key(height + 1)..) {
                let (key, _) = item?;
                if !key.starts_with(BLOCK_PREFIX) {
                    break;
                }
                batch.remove(key);
            }
        }
        for block in commit.blocks {
            batch.insert(block_key(block.height), serde_json::to_vec(block)?);
        }
        for (addr, account) in &commit.accounts {
            match account {
                Some(account) => batch.insert(account_key(addr), serde_json::to_vec(account)?),
                None => batch.remove(account_key(addr)),
            }
        }
        for hash in &commit.removed_txs {
            batch.remove(tx_key(hash));
        }
        for receipt in commit.receipts {
            batch.insert(tx_key(&receipt.tx_hash), serde_json::to_vec(receipt)?);
        }
        batch.insert(TIP_HEIGHT_KEY, &commit.tip_height.to_be_bytes()[..]);
        batch.insert(DIFFICULTY_KEY, &commit.difficulty.to_be_bytes()[..]);

        self.db.apply_batch(batch)?;
        self.db.flush()?;
        debug!(
            "[storage] committed tip={} blocks={} accounts={}",
            commit.tip_height,
            commit.blocks.len(),
            commit.accounts.len()
        );
        Ok(())
    }

    pub fn save_vdf_state(&self, state: &VdfState) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        batch.insert(VDF_SEED_KEY, &state.seed.0[..]);
        batch.insert(VDF_ITERATIONS_KEY, &state.iterations.to_be_bytes()[..]);
        batch.insert(VDF_OUTPUT_KEY, &state.output.0[..]);
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub fn load_vdf_state(&self) -> Result<Option<VdfState>, StorageError> {
        let (seed, output) = match (self.db.get(VDF_SEED_KEY)?, self.db.get(VDF_OUTPUT_KEY)?) {
            (Some(s), Some(o)) => (decode_hash(VDF_SEED_KEY, &s)?, decode_hash(VDF_OUTPUT_KEY, &o)?),
            _ => return Ok(None),
        };
        let iterations = self.get_u64(VDF_ITERATIONS_KEY)?.unwrap_or(0);
        Ok(Some(VdfState {
            seed,
            iterations,
            output,
        }))
    }

    pub fn genesis_hash(&self) -> Result<Option<Hash>, StorageError> {
        self.db
            .get(GENESIS_HASH_KEY)?
            .map(|v| decode_hash(GENESIS_HASH_KEY, &v))
            .transpose()
    }

    pub fn network_id(&self) -> Result<Option<u64>, StorageError> {
        self.get_u64(NETWORK_ID_KEY)
    }

    /// Record the chain identity; written once at genesis
    pub fn save_identity(&self, genesis_hash: &Hash, network_id: u64) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        batch.insert(GENESIS_HASH_KEY, &genesis_hash.0[..]);
        batch.insert(NETWORK_ID_KEY, &network_id.to_be_bytes()[..]);
        self.db.apply_batch(batch)?;
        Ok(())
    }

    pub fn save_peer<T: Serialize>(&self, addr: &str, record: &T) -> Result<(), StorageError> {
        self.db.insert(peer_key(addr), serde_json::to_vec(record)?)?;
        Ok(())
    }

    pub fn load_peers<T: DeserializeOwned>(&self) -> Result<Vec<T>, StorageError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix(PEER_PREFIX) {
            let (key, value) = item?;
            out.push(serde_json::from_slice(&value).map_err(|e| corrupt(&key, e))?);
        }
        Ok(out)
    }

    /// Flush pending writes; call on shutdown
    pub fn close(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
