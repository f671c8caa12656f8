//! Account world state
//!
//! Accounts are keyed by their 20-byte address. An account that sits at
//! `{balance: 0, nonce: 0}` is indistinguishable from an absent one: it is
//! left out of the state root and dropped when a revert brings it back there.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::tx::{Transaction, TxError};
use crate::crypto::Address;

/// Per-address balance and nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Account {
    /// Base units (8 decimals)
    pub balance: i64,
    /// Next expected transaction nonce
    pub nonce: u64,
}

impl Account {
    pub fn is_empty(&self) -> bool {
        self.balance == 0 && self.nonce == 0
    }
}

/// All accounts, ordered by address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorldState {
    accounts: BTreeMap<Address, Account>,
}

impl WorldState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed balances from genesis allocations
    pub fn from_allocations<I>(allocations: I) -> Result<Self, TxError>
    where
        I: IntoIterator<Item = (Address, i64)>,
    {
        let mut state = Self::new();
        for (addr, amount) in allocations {
            state.credit(&addr, amount)?;
        }
        Ok(state)
    }

    pub fn get(&self, addr: &Address) -> Option<&Account> {
        self.accounts.get(addr)
    }

    pub fn balance(&self, addr: &Address) -> i64 {
        self.accounts.get(addr).map_or(0, |a| a.balance)
    }

    pub fn nonce(&self, addr: &Address) -> u64 {
        self.accounts.get(addr).map_or(0, |a| a.nonce)
    }

    /// Overwrite an account, used when loading from storage
    pub fn insert(&mut self, addr: Address, account: Account) {
        self.accounts.insert(addr, account);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Address, &Account)> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Sum of all balances
    pub fn total_balance(&self) -> i128 {
        self.accounts.values().map(|a| a.balance as i128).sum()
    }

    /// Add `amount` to `addr`, creating a `{0, 0}` account if needed
    pub fn credit(&mut self, addr: &Address, amount: i64) -> Result<(), TxError> {
        let account = self.accounts.entry(*addr).or_default();
        account.balance = account
            .balance
            .checked_add(amount)
            .ok_or(TxError::BalanceOverflow)?;
        Ok(())
    }

    /// Apply one value transfer; the fee is burned
    pub fn apply_transfer(
        &mut self,
        from: &Address,
        to: &Address,
        amount: u64,
        fee: u64,
        nonce: u64,
    ) -> Result<(), TxError> {
        let total = amount as i128 + fee as i128;
        let sender = self
            .accounts
            .get(from)
            .copied()
            .ok_or(TxError::InsufficientFunds { need: total, have: 0 })?;

        if sender.nonce != nonce {
            return Err(TxError::BadNonce {
                expected: sender.nonce,
                got: nonce,
            });
        }
        if (sender.balance as i128) < total {
            return Err(TxError::InsufficientFunds {
                need: total,
                have: sender.balance,
            });
        }
        let credit = i64::try_from(amount).map_err(|_| TxError::BalanceOverflow)?;
        if self.balance(to).checked_add(credit).is_none() && from != to {
            return Err(TxError::BalanceOverflow);
        }

        // total <= balance <= i64::MAX so the debit fits
        let debited = Account {
            balance: sender.balance - total as i64,
            nonce: sender.nonce + 1,
        };
        self.accounts.insert(*from, debited);
        self.credit(to, credit)
    }

    /// Undo `apply_transfer`, restoring the sender's nonce and balance
    pub fn revert_transfer(&mut self, from: &Address, to: &Address, amount: u64, fee: u64) {
        let amount = amount as i64;
        if let Some(receiver) = self.accounts.get_mut(to) {
            receiver.balance -= amount;
        }
        let sender = self.accounts.entry(*from).or_default();
        sender.balance += amount + fee as i64;
        sender.nonce = sender.nonce.saturating_sub(1);
        self.prune(to);
        self.prune(from);
    }

    /// Apply a transaction whose signature has already been checked
    pub fn apply_tx(&mut self, tx: &Transaction) -> Result<(), TxError> {
        match tx {
            Transaction::Coinbase { to, amount, .. } => {
                let amount = i64::try_from(*amount).map_err(|_| TxError::BalanceOverflow)?;
                self.credit(to, amount)
            }
            other => {
                let from = other.sender().ok_or(TxError::CoinbaseNotAllowed)?;
                self.apply_transfer(&from, &other.recipient(), other.amount(), other.fee(), other.nonce())
            }
        }
    }

    /// Undo `apply_tx`
    pub fn revert_tx(&mut self, tx: &Transaction) {
        match tx {
            Transaction::Coinbase { to, amount, .. } => {
                if let Some(account) = self.accounts.get_mut(to) {
                    account.balance -= *amount as i64;
                }
                self.prune(to);
            }
            other => {
                if let Some(from) = other.sender() {
                    self.revert_transfer(&from, &other.recipient(), other.amount(), other.fee());
                }
            }
        }
    }

    /// Reverse-apply a block's transactions, last first
    pub fn revert_block(&mut self, txs: &[Transaction]) {
        for tx in txs.iter().rev() {
            self.revert_tx(tx);
        }
    }

    fn prune(&mut self, addr: &Address) {
        if self.accounts.get(addr).map_or(false, Account::is_empty) {
            self.accounts.remove(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b; 20])
    }

    fn funded() -> WorldState {
        WorldState::from_allocations([(addr(1), 1_000)]).unwrap()
    }

    #[test]
    fn test_transfer_burns_fee() {
        let mut state = funded();
        state.apply_transfer(&addr(1), &addr(2), 300, 10, 0).unwrap();
        assert_eq!(state.balance(&addr(1)), 690);
        assert_eq!(state.balance(&addr(2)), 300);
        assert_eq!(state.nonce(&addr(1)), 1);
        assert_eq!(state.total_balance(), 990);
    }

    #[test]
    fn test_missing_sender_is_insufficient_funds() {
        let mut state = funded();
        assert!(matches!(
            state.apply_transfer(&addr(9), &addr(2), 1, 1, 0),
            Err(TxError::InsufficientFunds { have: 0, .. })
        ));
    }

    #[test]
    fn test_nonce_checked_before_balance() {
        let mut state = funded();
        assert_eq!(
            state.apply_transfer(&addr(1), &addr(2), 5_000, 1, 3),
            Err(TxError::BadNonce { expected: 0, got: 3 })
        );
    }

    #[test]
    fn test_exact_balance_spend() {
        let mut state = funded();
        state.apply_transfer(&addr(1), &addr(2), 990, 10, 0).unwrap();
        assert_eq!(state.balance(&addr(1)), 0);
        assert!(state
            .apply_transfer(&addr(1), &addr(2), 1, 1, 1)
            .is_err());
    }

    #[test]
    fn test_failed_transfer_leaves_state_untouched() {
        let mut state = funded();
        let before = state.clone();
        assert!(state.apply_transfer(&addr(1), &addr(2), 1_000, 1, 0).is_err());
        assert_eq!(state, before);
    }

    #[test]
    fn test_revert_restores_exact_state() {
        let mut state = funded();
        let before = state.clone();
        let txs = vec![
            Transaction::Coinbase { to: addr(3), amount: 50, height: 1 },
        ];
        for tx in &txs {
            state.apply_tx(tx).unwrap();
        }
        state.apply_transfer(&addr(1), &addr(2), 100, 5, 0).unwrap();
        state.revert_transfer(&addr(1), &addr(2), 100, 5);
        state.revert_block(&txs);
        assert_eq!(state, before);
        assert!(state.get(&addr(2)).is_none());
    }

    #[test]
    fn test_self_transfer() {
        let mut state = funded();
        state.apply_transfer(&addr(1), &addr(1), 100, 1, 0).unwrap();
        assert_eq!(state.balance(&addr(1)), 999);
        assert_eq!(state.nonce(&addr(1)), 1);
    }
}
