//! Ledger errors
//!
//! Every failure aborts the whole operation. [`ErrorKind`] classifies each
//! error so callers can tell authorization, timing, state and dependency
//! failures apart.

use serde::Serialize;
use thiserror::Error;

use crate::authority::AuthorityError;
use crate::token::TokenError;
use crate::types::{AccountId, Balance, BountyId, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller is not the required role.
    Authorization,
    /// Outside the legal time window.
    Timing,
    /// Incompatible bounty or stake state.
    State,
    /// Token transfer or authority notification failed.
    Dependency,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("bounty {0} does not exist")]
    BountyNotFound(BountyId),

    #[error("{caller} is not the validator authority of bounty {bounty_id}")]
    NotValidatorAuthority { bounty_id: BountyId, caller: AccountId },
    #[error("{caller} is not the creator of bounty {bounty_id}")]
    NotCreator { bounty_id: BountyId, caller: AccountId },

    #[error("expiry {expires_at} is not after the current time {now}")]
    ExpiryNotInFuture { expires_at: Timestamp, now: Timestamp },
    #[error("bounty {bounty_id} expired at {expires_at}")]
    BountyExpired { bounty_id: BountyId, expires_at: Timestamp },
    #[error("bounty {bounty_id} does not expire until after {expires_at}")]
    BountyNotExpired { bounty_id: BountyId, expires_at: Timestamp },

    #[error("bounty {0} already has a winner")]
    WinnerAlreadySet(BountyId),
    #[error("bounty {0} is cancelled")]
    BountyCancelled(BountyId),
    #[error("bounty {bounty_id} still holds {total_staked} staked security")]
    BountyHasStakes { bounty_id: BountyId, total_staked: Balance },
    #[error("{staker} has nothing staked on bounty {bounty_id}")]
    NothingStaked { bounty_id: BountyId, staker: AccountId },
    #[error("{staker} already claimed from bounty {bounty_id}")]
    AlreadyClaimed { bounty_id: BountyId, staker: AccountId },
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
    #[error("ledger is busy with another operation")]
    Reentrancy,

    #[error("validator authority rejected bounty {bounty_id}: {source}")]
    Authority {
        bounty_id: BountyId,
        #[source]
        source: AuthorityError,
    },
    #[error("token transfer failed: {0}")]
    Token(#[from] TokenError),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BountyNotFound(_) => ErrorKind::NotFound,
            Self::NotValidatorAuthority { .. } | Self::NotCreator { .. } => {
                ErrorKind::Authorization
            }
            Self::ExpiryNotInFuture { .. }
            | Self::BountyExpired { .. }
            | Self::BountyNotExpired { .. } => ErrorKind::Timing,
            Self::WinnerAlreadySet(_)
            | Self::BountyCancelled(_)
            | Self::BountyHasStakes { .. }
            | Self::NothingStaked { .. }
            | Self::AlreadyClaimed { .. }
            | Self::ZeroAmount
            | Self::Overflow(_)
            | Self::Reentrancy => ErrorKind::State,
            Self::Authority { .. } | Self::Token(_) => ErrorKind::Dependency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(
            LedgerError::NotCreator {
                bounty_id: 0,
                caller: "mallory".into()
            }
            .kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            LedgerError::BountyNotExpired {
                bounty_id: 0,
                expires_at: 10
            }
            .kind(),
            ErrorKind::Timing
        );
        assert_eq!(LedgerError::WinnerAlreadySet(0).kind(), ErrorKind::State);
        assert_eq!(
            LedgerError::Token(TokenError::Rejected("paused".into())).kind(),
            ErrorKind::Dependency
        );
        assert_eq!(LedgerError::BountyNotFound(9).kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_messages() {
        let err = LedgerError::AlreadyClaimed {
            bounty_id: 2,
            staker: "alice".into(),
        };
        assert_eq!(err.to_string(), "alice already claimed from bounty 2");
    }
}
