//! Pending transaction pool
//!
//! A FIFO queue behind one mutex. Ingest checks the sender can pay and the
//! nonce follows the account nonce plus whatever that sender already queued.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use thiserror::Error;

use crate::crypto::Hash;
use crate::ledger::{Transaction, TxError, WorldState};

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in mempool")]
    Duplicate,
    #[error("mempool full ({0} transactions)")]
    Full(usize),
    #[error(transparent)]
    Rejected(#[from] TxError),
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<Transaction>,
    hashes: HashSet<Hash>,
}

/// Mutex-guarded FIFO of verified user transactions
#[derive(Debug)]
pub struct Mempool {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    /// Admit a signature-checked transaction after stateful pre-checks
    pub fn add(&self, tx: Transaction, world: &WorldState) -> Result<Hash, MempoolError> {
        if tx.is_coinbase() {
            return Err(TxError::CoinbaseNotAllowed.into());
        }
        let sender = tx.sender().ok_or(TxError::CoinbaseNotAllowed)?;
        let hash = tx.hash();

        let mut inner = self.inner.lock();
        if inner.hashes.contains(&hash) {
            return Err(MempoolError::Duplicate);
        }
        if inner.queue.len() >= self.capacity {
            return Err(MempoolError::Full(self.capacity));
        }

        let account = world.get(&sender).copied().unwrap_or_default();
        let need = tx.amount() as i128 + tx.fee() as i128;
        if world.get(&sender).is_none() || (account.balance as i128) < need {
            return Err(TxError::InsufficientFunds {
                need,
                have: account.balance,
            }
            .into());
        }
        let queued = inner
            .queue
            .iter()
            .filter(|q| q.sender() == Some(sender))
            .count() as u64;
        let expected = account.nonce + queued;
        if tx.nonce() != expected {
            return Err(TxError::BadNonce {
                expected,
                got: tx.nonce(),
            }
            .into());
        }

        inner.hashes.insert(hash);
        inner.queue.push_back(tx);
        Ok(hash)
    }

    /// Snapshot of queued transactions, oldest first
    pub fn pending(&self) -> Vec<Transaction> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Take everything for the block builder
    pub fn drain(&self) -> Vec<Transaction> {
        let mut inner = self.inner.lock();
        inner.hashes.clear();
        inner.queue.drain(..).collect()
    }

    /// Put transactions a block could not fit back at the head of the queue
    pub fn requeue(&self, txs: Vec<Transaction>) {
        let mut inner = self.inner.lock();
        for tx in txs.into_iter().rev() {
            if inner.hashes.insert(tx.hash()) {
                inner.queue.push_front(tx);
            }
        }
    }

    /// Drop transactions included by a block received from elsewhere
    pub fn remove_included(&self, included: &[Transaction]) {
        let hashes: HashSet<Hash> = included.iter().map(Transaction::hash).collect();
        let mut inner = self.inner.lock();
        inner.queue.retain(|tx| !hashes.contains(&tx.hash()));
        inner.hashes.retain(|h| !hashes.contains(h));
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Address, PrivateKey};
    use crate::ledger::LegacyTx;

    fn setup() -> (PrivateKey, WorldState) {
        let key = PrivateKey::from_bytes(&[8; 32]).unwrap();
        let world =
            WorldState::from_allocations([(key.public_key().legacy_address(), 1_000)]).unwrap();
        (key, world)
    }

    fn transfer(key: &PrivateKey, amount: u64, nonce: u64) -> Transaction {
        Transaction::Transfer(LegacyTx::signed(key, Address([2; 20]), amount, 1, nonce).unwrap())
    }

    #[test]
    fn test_sequential_nonces_queue() {
        let (key, world) = setup();
        let pool = Mempool::default();
        pool.add(transfer(&key, 10, 0), &world).unwrap();
        pool.add(transfer(&key, 10, 1), &world).unwrap();
        assert_eq!(
            pool.add(transfer(&key, 10, 5), &world),
            Err(MempoolError::Rejected(TxError::BadNonce { expected: 2, got: 5 }))
        );
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let (key, world) = setup();
        let pool = Mempool::default();
        let tx = transfer(&key, 10, 0);
        pool.add(tx.clone(), &world).unwrap();
        assert_eq!(pool.add(tx, &world), Err(MempoolError::Duplicate));
    }

    #[test]
    fn test_unfunded_sender_rejected() {
        let (_, world) = setup();
        let pool = Mempool::default();
        let stranger = PrivateKey::generate();
        assert!(matches!(
            pool.add(transfer(&stranger, 1, 0), &world),
            Err(MempoolError::Rejected(TxError::InsufficientFunds { .. }))
        ));
    }

    #[test]
    fn test_capacity_and_drain() {
        let (key, world) = setup();
        let pool = Mempool::new(1);
        pool.add(transfer(&key, 1, 0), &world).unwrap();
        assert_eq!(pool.add(transfer(&key, 1, 1), &world), Err(MempoolError::Full(1)));
        let drained = pool.drain();
        assert_eq!(drained.len(), 1);
        assert!(pool.is_empty());
        assert!(!pool.contains(&drained[0].hash()));
    }

    #[test]
    fn test_remove_included() {
        let (key, world) = setup();
        let pool = Mempool::default();
        let a = transfer(&key, 1, 0);
        pool.add(a.clone(), &world).unwrap();
        pool.add(transfer(&key, 1, 1), &world).unwrap();
        pool.remove_included(&[a]);
        assert_eq!(pool.pending().len(), 1);
    }

    #[test]
    fn test_requeue_keeps_order() {
        let (key, world) = setup();
        let pool = Mempool::default();
        pool.add(transfer(&key, 1, 0), &world).unwrap();
        pool.add(transfer(&key, 1, 1), &world).unwrap();
        let drained = pool.drain();
        pool.requeue(drained[1..].to_vec());
        assert_eq!(pool.pending()[0].nonce(), 1);
        assert!(pool.contains(&drained[1].hash()));
    }
}
