//! Transfer journal for one ledger operation.
//!
//! Records every transfer the operation has executed. Dropping an uncommitted
//! settlement reverses them newest first, so a failure in a later transfer
//! leaves no balance change behind.

use tracing::{error, warn};

use crate::token::{TokenError, TokenMover};
use crate::types::{AccountId, Balance, TokenId};

#[derive(Debug)]
enum Leg {
    /// Pulled into custody.
    In {
        token: TokenId,
        from: AccountId,
        amount: Balance,
    },
    /// Paid out of custody.
    Out {
        token: TokenId,
        to: AccountId,
        amount: Balance,
    },
}

pub(crate) struct Settlement<'a> {
    tokens: &'a dyn TokenMover,
    custody: &'a AccountId,
    legs: Vec<Leg>,
    committed: bool,
}

impl<'a> Settlement<'a> {
    pub(crate) fn new(tokens: &'a dyn TokenMover, custody: &'a AccountId) -> Self {
        Self {
            tokens,
            custody,
            legs: Vec::new(),
            committed: false,
        }
    }

    /// Move `amount` of `token` from `from` into custody.
    pub(crate) fn pull(
        &mut self,
        token: &TokenId,
        from: &AccountId,
        amount: Balance,
    ) -> Result<(), TokenError> {
        if amount == 0 {
            return Ok(());
        }
        self.tokens
            .transfer_from(token, from, self.custody, amount)?;
        self.legs.push(Leg::In {
            token: token.clone(),
            from: from.clone(),
            amount,
        });
        Ok(())
    }

    /// Pay `amount` of `token` out of custody to `to`.
    pub(crate) fn pay(
        &mut self,
        token: &TokenId,
        to: &AccountId,
        amount: Balance,
    ) -> Result<(), TokenError> {
        if amount == 0 {
            return Ok(());
        }
        self.tokens.transfer(token, to, amount)?;
        self.legs.push(Leg::Out {
            token: token.clone(),
            to: to.clone(),
            amount,
        });
        Ok(())
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }

    fn unwind(&mut self) {
        for leg in self.legs.drain(..).rev() {
            let reversed = match &leg {
                Leg::In {
                    token,
                    from,
                    amount,
                } => self.tokens.transfer(token, from, *amount),
                Leg::Out { token, to, amount } => {
                    self.tokens.transfer_from(token, to, self.custody, *amount)
                }
            };
            if let Err(e) = reversed {
                error!("Failed to reverse {:?}: {}", leg, e);
            }
        }
    }
}

impl Drop for Settlement<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.legs.is_empty() {
            warn!("Unwinding {} transfer(s) of an aborted operation", self.legs.len());
            self.unwind();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::BalanceBook;

    #[test]
    fn test_drop_without_commit_reverses_transfers() {
        let book = BalanceBook::new("escrow".into());
        let custody: AccountId = "escrow".into();
        book.deposit(&"USDC".into(), &"alice".into(), 100).unwrap();
        book.deposit(&"USDC".into(), &"escrow".into(), 50).unwrap();

        {
            let mut settlement = Settlement::new(&book, &custody);
            settlement.pull(&"USDC".into(), &"alice".into(), 40).unwrap();
            settlement.pay(&"USDC".into(), &"bob".into(), 70).unwrap();
            assert!(settlement.pay(&"USDC".into(), &"bob".into(), 1_000).is_err());
        }

        assert_eq!(book.balance_of(&"USDC".into(), &"alice".into()), 100);
        assert_eq!(book.balance_of(&"USDC".into(), &"escrow".into()), 50);
        assert_eq!(book.balance_of(&"USDC".into(), &"bob".into()), 0);
    }

    #[test]
    fn test_commit_keeps_transfers() {
        let book = BalanceBook::new("escrow".into());
        let custody: AccountId = "escrow".into();
        book.deposit(&"USDC".into(), &"alice".into(), 100).unwrap();

        let mut settlement = Settlement::new(&book, &custody);
        settlement.pull(&"USDC".into(), &"alice".into(), 40).unwrap();
        settlement.commit();

        assert_eq!(book.balance_of(&"USDC".into(), &"escrow".into()), 40);
    }
}
