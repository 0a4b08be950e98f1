//! Ledger data model
//!
//! Bounties live in an arena indexed by their sequential id. Stake records are
//! keyed by `(bounty id, staker)` and kept by the ledger next to the arena.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sequential bounty identifier, starting at 0.
pub type BountyId = u64;

/// Token quantity.
pub type Balance = u128;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

/// Opaque account identifier (an SS58 address on the HTTP surface).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of a fungible token known to the token mover.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(String);

impl TokenId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TokenId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TokenId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Winner reported by the validator authority.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Winner {
    pub account: AccountId,
    pub awarded_at: Timestamp,
}

/// One escrowed bounty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounty {
    pub id: BountyId,
    pub creator: AccountId,
    pub validator_authority: AccountId,
    pub reward_token: TokenId,
    pub reward_amount: Balance,
    /// Reward already paid out to stakers after expiry. Never exceeds `reward_amount`.
    pub claimed_reward_amount: Balance,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    pub winner: Option<Winner>,
    /// Sum of every stake record's `staked_amount` for this bounty.
    pub total_staked: Balance,
    pub cancelled_at: Option<Timestamp>,
}

impl Bounty {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    pub fn has_winner(&self) -> bool {
        self.winner.is_some()
    }

    /// Strictly before expiry: staking and winner reporting are open.
    pub fn is_open_at(&self, now: Timestamp) -> bool {
        now < self.expires_at
    }

    /// Strictly after expiry: claims and cancellation are possible.
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now > self.expires_at
    }

    /// Reward not yet distributed to stakers.
    pub fn remaining_reward(&self) -> Balance {
        self.reward_amount.saturating_sub(self.claimed_reward_amount)
    }

    pub fn status(&self, now: Timestamp) -> BountyStatus {
        if self.has_winner() {
            BountyStatus::Awarded
        } else if self.is_cancelled() {
            BountyStatus::Cancelled
        } else if self.is_open_at(now) {
            BountyStatus::Open
        } else {
            BountyStatus::Expired
        }
    }
}

/// Lifecycle position of a bounty, derived from its fields and the current time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BountyStatus {
    /// Accepting stakes and a winner report.
    Open,
    /// Reached `expires_at` without a winner. Claims and cancellation open
    /// only once `now > expires_at`, so at the expiry instant itself the
    /// bounty is neither open nor claimable.
    Expired,
    Awarded,
    Cancelled,
}

/// Collateral one account has staked on one bounty.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeRecord {
    pub staked_amount: Balance,
    pub last_staked_at: Timestamp,
    /// Collateral and reward share have been withdrawn. Irreversible.
    pub claimed: bool,
}

/// Read-only bounty record returned by ledger queries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BountyView {
    #[serde(flatten)]
    pub bounty: Bounty,
    pub status: BountyStatus,
    pub stakers: usize,
}
