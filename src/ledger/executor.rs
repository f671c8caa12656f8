//! Execution engine seam: state root, receipts root and gas

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::state::WorldState;
use super::tx::Transaction;
use crate::constants::{EMPTY_ROOT_HEX, TRANSFER_GAS};
use crate::crypto::{Address, Hash};

/// Root of an empty account set or receipt list
pub fn empty_root() -> Hash {
    Hash::from_hex(EMPTY_ROOT_HEX).unwrap_or_default()
}

/// Block fields an engine may depend on
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub height: u64,
    pub timestamp: i64,
    pub farmer: Address,
    pub gas_limit: u64,
}

/// Per-transaction execution record, indexed under `tx:<hash>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: Hash,
    pub height: u64,
    pub index: u32,
    /// 1 on success
    pub status: u8,
    pub gas_used: u64,
    pub from: String,
    pub to: Address,
    pub amount: u64,
    pub fee: u64,
}

/// What an engine reports after running a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub state_root: Hash,
    pub receipts_root: Hash,
    pub gas_used: u64,
    pub receipts: Vec<Receipt>,
}

/// Pure function from `(prev_state_root, block, txs)` to roots and gas
///
/// `world` is the account state after the block's transactions have been
/// applied.
pub trait ExecutionEngine: Send + Sync {
    fn execute(
        &self,
        prev_state_root: &Hash,
        ctx: &BlockContext,
        world: &WorldState,
        txs: &[Transaction],
    ) -> ExecutionOutcome;
}

/// Value-transfer engine: flat gas per user transaction
#[derive(Debug, Default, Clone, Copy)]
pub struct TransferEngine;

impl ExecutionEngine for TransferEngine {
    fn execute(
        &self,
        _prev_state_root: &Hash,
        ctx: &BlockContext,
        world: &WorldState,
        txs: &[Transaction],
    ) -> ExecutionOutcome {
        let receipts: Vec<Receipt> = txs
            .iter()
            .enumerate()
            .filter(|(_, tx)| !tx.is_coinbase())
            .map(|(index, tx)| Receipt {
                tx_hash: tx.hash(),
                height: ctx.height,
                index: index as u32,
                status: 1,
                gas_used: TRANSFER_GAS,
                from: tx.from_label(),
                to: tx.recipient(),
                amount: tx.amount(),
                fee: tx.fee(),
            })
            .collect();

        ExecutionOutcome {
            state_root: state_root(world),
            receipts_root: receipts_root(&receipts),
            gas_used: receipts.iter().map(|r| r.gas_used).sum(),
            receipts,
        }
    }
}

/// SHA-256 over `addr || balance_be || nonce_be` of every non-empty account
pub fn state_root(world: &WorldState) -> Hash {
    let mut hasher = Sha256::new();
    let mut any = false;
    for (addr, account) in world.iter().filter(|(_, a)| !a.is_empty()) {
        hasher.update(addr.0);
        hasher.update(account.balance.to_be_bytes());
        hasher.update(account.nonce.to_be_bytes());
        any = true;
    }
    if any {
        Hash(hasher.finalize().into())
    } else {
        empty_root()
    }
}

/// SHA-256 over `tx_hash || status || gas_used_be` of each receipt
pub fn receipts_root(receipts: &[Receipt]) -> Hash {
    if receipts.is_empty() {
        return empty_root();
    }
    let mut hasher = Sha256::new();
    for r in receipts {
        hasher.update(r.tx_hash.0);
        hasher.update([r.status]);
        hasher.update(r.gas_used.to_be_bytes());
    }
    Hash(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;
    use crate::ledger::LegacyTx;

    fn ctx() -> BlockContext {
        BlockContext {
            height: 1,
            timestamp: 0,
            farmer: Address([1; 20]),
            gas_limit: 30_000_000,
        }
    }

    #[test]
    fn test_empty_roots() {
        let out = TransferEngine.execute(&Hash::zero(), &ctx(), &WorldState::new(), &[]);
        assert_eq!(out.state_root.to_hex(), EMPTY_ROOT_HEX);
        assert_eq!(out.receipts_root.to_hex(), EMPTY_ROOT_HEX);
        assert_eq!(out.gas_used, 0);
    }

    #[test]
    fn test_gas_and_receipts_skip_coinbase() {
        let key = PrivateKey::generate();
        let txs = vec![
            Transaction::coinbase(Address([1; 20]), 10, 1),
            Transaction::Transfer(LegacyTx::signed(&key, Address([2; 20]), 5, 1, 0).unwrap()),
        ];
        let world = WorldState::from_allocations([(Address([1; 20]), 10)]).unwrap();
        let out = TransferEngine.execute(&Hash::zero(), &ctx(), &world, &txs);
        assert_eq!(out.gas_used, TRANSFER_GAS);
        assert_eq!(out.receipts.len(), 1);
        assert_eq!(out.receipts[0].index, 1);
        assert_ne!(out.receipts_root, empty_root());
    }

    #[test]
    fn test_state_root_ignores_empty_accounts() {
        let mut a = WorldState::from_allocations([(Address([1; 20]), 10)]).unwrap();
        let root = state_root(&a);
        a.insert(Address([2; 20]), Default::default());
        assert_eq!(state_root(&a), root);
        a.credit(&Address([2; 20]), 1).unwrap();
        assert_ne!(state_root(&a), root);
    }
}
