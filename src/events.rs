//! Ledger event log
//!
//! Append-only, ordered record of committed transitions. Each entry carries
//! enough identity and numeric context to rebuild ledger state off-system.

use serde::{Deserialize, Serialize};

use crate::types::{AccountId, Balance, BountyId, Timestamp, TokenId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    BountyCreated {
        creator: AccountId,
        bounty_id: BountyId,
        validator_authority: AccountId,
        reward_token: TokenId,
        reward_amount: Balance,
        created_at: Timestamp,
        expires_at: Timestamp,
    },
    BountySecurityStaked {
        bounty_id: BountyId,
        staker: AccountId,
        stake_delta: Balance,
        staker_total_staked: Balance,
        bounty_total_staked: Balance,
        staked_at: Timestamp,
    },
    BountyAwarded {
        winner: AccountId,
        bounty_id: BountyId,
        timestamp: Timestamp,
        reward_token: TokenId,
        reward_amount: Balance,
        total_staked_at_award: Balance,
    },
    BountyCancelled {
        bounty_id: BountyId,
        creator: AccountId,
        cancelled_at: Timestamp,
    },
    BountyStakeClaimed {
        bounty_id: BountyId,
        staker: AccountId,
        collateral_returned: Balance,
        reward_share: Balance,
        claimed_reward_total: Balance,
        claimed_at: Timestamp,
    },
}

impl LedgerEvent {
    pub fn bounty_id(&self) -> BountyId {
        match self {
            Self::BountyCreated { bounty_id, .. }
            | Self::BountySecurityStaked { bounty_id, .. }
            | Self::BountyAwarded { bounty_id, .. }
            | Self::BountyCancelled { bounty_id, .. }
            | Self::BountyStakeClaimed { bounty_id, .. } => *bounty_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::BountyCreated { .. } => "bounty_created",
            Self::BountySecurityStaked { .. } => "bounty_security_staked",
            Self::BountyAwarded { .. } => "bounty_awarded",
            Self::BountyCancelled { .. } => "bounty_cancelled",
            Self::BountyStakeClaimed { .. } => "bounty_stake_claimed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub seq: u64,
    pub event: LedgerEvent,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Vec<RecordedEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Sequence numbers must be contiguous from 0.
    pub fn from_entries(entries: Vec<RecordedEvent>) -> Option<Self> {
        let contiguous = entries
            .iter()
            .enumerate()
            .all(|(i, e)| e.seq == i as u64);
        contiguous.then_some(Self { entries })
    }

    pub fn append(&mut self, event: LedgerEvent) -> u64 {
        let seq = self.entries.len() as u64;
        self.entries.push(RecordedEvent { seq, event });
        seq
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with `seq >= since`.
    pub fn since(&self, since: u64) -> &[RecordedEvent] {
        let start = usize::try_from(since)
            .unwrap_or(usize::MAX)
            .min(self.entries.len());
        &self.entries[start..]
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordedEvent> {
        self.entries.iter()
    }
}
