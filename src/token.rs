//! Token movement
//!
//! The ledger never keeps balances itself. It directs transfers in and out of
//! its custody account through a [`TokenMover`]. Each call either moves the
//! full amount or leaves every balance untouched.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::types::{AccountId, Balance, TokenId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("{account} holds {available} {token}, needs {needed}")]
    InsufficientBalance {
        token: TokenId,
        account: AccountId,
        needed: Balance,
        available: Balance,
    },
    #[error("balance of {account} in {token} would overflow")]
    Overflow { token: TokenId, account: AccountId },
    #[error("transfer rejected: {0}")]
    Rejected(String),
}

/// Moves fungible tokens on behalf of the ledger.
pub trait TokenMover: Send + Sync {
    /// Pay `amount` of `token` out of the ledger's custody account.
    fn transfer(&self, token: &TokenId, to: &AccountId, amount: Balance) -> Result<(), TokenError>;

    /// Move `amount` of `token` from `from` to `to`.
    fn transfer_from(
        &self,
        token: &TokenId,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), TokenError>;
}

/// One `(token, account, amount)` row of a balance book snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub token: TokenId,
    pub account: AccountId,
    pub amount: Balance,
}

/// In-process balance book.
///
/// Allowances are not modelled: `transfer_from` is trusted to be called only
/// by the ledger, which authenticates the `from` account itself.
pub struct BalanceBook {
    custody: AccountId,
    balances: RwLock<HashMap<(TokenId, AccountId), Balance>>,
}

impl BalanceBook {
    pub fn new(custody: AccountId) -> Self {
        Self {
            custody,
            balances: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_entries(custody: AccountId, entries: impl IntoIterator<Item = BalanceEntry>) -> Self {
        let book = Self::new(custody);
        {
            let mut balances = book.balances.write();
            for entry in entries {
                balances.insert((entry.token, entry.account), entry.amount);
            }
        }
        book
    }

    pub fn custody(&self) -> &AccountId {
        &self.custody
    }

    /// Credit `amount` to `account`. Used only for genesis seeding.
    pub fn deposit(&self, token: &TokenId, account: &AccountId, amount: Balance) -> Result<(), TokenError> {
        let mut balances = self.balances.write();
        let slot = balances
            .entry((token.clone(), account.clone()))
            .or_insert(0);
        *slot = slot.checked_add(amount).ok_or_else(|| TokenError::Overflow {
            token: token.clone(),
            account: account.clone(),
        })?;
        Ok(())
    }

    pub fn balance_of(&self, token: &TokenId, account: &AccountId) -> Balance {
        self.balances
            .read()
            .get(&(token.clone(), account.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of every balance held in `token`.
    pub fn total_supply(&self, token: &TokenId) -> Balance {
        self.balances
            .read()
            .iter()
            .filter(|((t, _), _)| t == token)
            .fold(0, |acc, (_, amount)| acc.saturating_add(*amount))
    }

    /// Non-zero balances, sorted by token then account.
    pub fn entries(&self) -> Vec<BalanceEntry> {
        let mut entries: Vec<BalanceEntry> = self
            .balances
            .read()
            .iter()
            .filter(|(_, amount)| **amount > 0)
            .map(|((token, account), amount)| BalanceEntry {
                token: token.clone(),
                account: account.clone(),
                amount: *amount,
            })
            .collect();
        entries.sort_by(|a, b| (&a.token, &a.account).cmp(&(&b.token, &b.account)));
        entries
    }

    fn move_balance(
        &self,
        token: &TokenId,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), TokenError> {
        let mut balances = self.balances.write();

        let available = balances
            .get(&(token.clone(), from.clone()))
            .copied()
            .unwrap_or(0);
        if available < amount {
            return Err(TokenError::InsufficientBalance {
                token: token.clone(),
                account: from.clone(),
                needed: amount,
                available,
            });
        }
        if from == to {
            return Ok(());
        }

        let credited = balances
            .get(&(token.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
            .checked_add(amount)
            .ok_or_else(|| TokenError::Overflow {
                token: token.clone(),
                account: to.clone(),
            })?;

        // Both sides validated; apply together.
        balances.insert((token.clone(), from.clone()), available - amount);
        balances.insert((token.clone(), to.clone()), credited);

        debug!("Moved {} {} from {} to {}", amount, token, from, to);
        Ok(())
    }
}

impl TokenMover for BalanceBook {
    fn transfer(&self, token: &TokenId, to: &AccountId, amount: Balance) -> Result<(), TokenError> {
        self.move_balance(token, &self.custody, to, amount)
    }

    fn transfer_from(
        &self,
        token: &TokenId,
        from: &AccountId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), TokenError> {
        self.move_balance(token, from, to, amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> BalanceBook {
        let book = BalanceBook::new("escrow".into());
        book.deposit(&"USDC".into(), &"alice".into(), 500).unwrap();
        book
    }

    #[test]
    fn test_transfer_from_moves_balance() {
        let book = book();
        book.transfer_from(&"USDC".into(), &"alice".into(), &"escrow".into(), 200)
            .unwrap();

        assert_eq!(book.balance_of(&"USDC".into(), &"alice".into()), 300);
        assert_eq!(book.balance_of(&"USDC".into(), &"escrow".into()), 200);
        assert_eq!(book.total_supply(&"USDC".into()), 500);
    }

    #[test]
    fn test_failed_transfer_leaves_balances_untouched() {
        let book = book();
        let err = book
            .transfer_from(&"USDC".into(), &"alice".into(), &"bob".into(), 501)
            .unwrap_err();

        assert_eq!(
            err,
            TokenError::InsufficientBalance {
                token: "USDC".into(),
                account: "alice".into(),
                needed: 501,
                available: 500,
            }
        );
        assert_eq!(book.balance_of(&"USDC".into(), &"alice".into()), 500);
        assert_eq!(book.balance_of(&"USDC".into(), &"bob".into()), 0);
    }

    #[test]
    fn test_transfer_pays_out_of_custody() {
        let book = book();
        book.transfer_from(&"USDC".into(), &"alice".into(), &"escrow".into(), 100)
            .unwrap();
        book.transfer(&"USDC".into(), &"bob".into(), 60).unwrap();

        assert_eq!(book.balance_of(&"USDC".into(), &"escrow".into()), 40);
        assert_eq!(book.balance_of(&"USDC".into(), &"bob".into()), 60);
        assert!(book.transfer(&"USDC".into(), &"bob".into(), 41).is_err());
    }

    #[test]
    fn test_entries_round_trip() {
        let book = book();
        book.deposit(&"SEC".into(), &"bob".into(), 7).unwrap();

        let restored = BalanceBook::from_entries("escrow".into(), book.entries());
        assert_eq!(restored.entries(), book.entries());
        assert_eq!(restored.balance_of(&"SEC".into(), &"bob".into()), 7);
    }
}
