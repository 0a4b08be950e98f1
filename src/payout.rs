//! Stake accounting and proportional payout
//!
//! After expiry without a winner every staker reclaims its collateral plus
//! `floor(reward * stake / total_staked)` of the reward, capped at whatever is
//! still undistributed. Truncation leaves a residue in custody that nobody
//! can claim; the cap guarantees the sum of payouts never exceeds the reward.

use serde::Serialize;
use thiserror::Error;

use crate::types::{AccountId, Balance, Bounty, StakeRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("bounty {bounty_id}: total_staked {recorded} but stake records sum to {summed}")]
    StakeSumMismatch {
        bounty_id: u64,
        recorded: Balance,
        summed: Balance,
    },
    #[error("bounty {bounty_id}: claimed reward {claimed} exceeds reward {reward}")]
    OverDistributed {
        bounty_id: u64,
        claimed: Balance,
        reward: Balance,
    },
    #[error("bounty {0} is both awarded and cancelled")]
    AwardedAndCancelled(u64),
    #[error("bounty {bounty_id} is cancelled with {total_staked} staked")]
    CancelledWithStake { bounty_id: u64, total_staked: Balance },
    #[error("bounty {0} expires before it was created")]
    ExpiryBeforeCreation(u64),
    #[error("bounty at position {position} carries id {id}")]
    IdOutOfSequence { position: u64, id: u64 },
    #[error("stake record for unknown bounty {0}")]
    OrphanStake(u64),
    #[error("event log is not contiguous")]
    EventGap,
}

/// Reward owed to one claimant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Share {
    /// `floor(reward * stake / total)` before capping.
    pub proportional: Balance,
    /// Amount actually paid: `min(proportional, remaining)`.
    pub paid: Balance,
}

/// `floor(a * b / c)` for `b <= c`, or `None` if it cannot be computed in u128.
///
/// With `b <= c` the result is at most `a`, so only the intermediate product
/// can overflow. Splitting `a = q * c + r` keeps it in range for every input
/// where `r * b` fits.
fn mul_div_floor(a: Balance, b: Balance, c: Balance) -> Option<Balance> {
    if c == 0 {
        return None;
    }
    if let Some(product) = a.checked_mul(b) {
        return Some(product / c);
    }
    let q = a / c;
    let r = a % c;
    let whole = q.checked_mul(b)?;
    let frac = r.checked_mul(b)? / c;
    whole.checked_add(frac)
}

/// Truncating proportional share of `reward` for `stake` out of `total_staked`.
pub fn proportional_share(reward: Balance, stake: Balance, total_staked: Balance) -> Option<Balance> {
    if stake > total_staked {
        return None;
    }
    mul_div_floor(reward, stake, total_staked)
}

/// Share paid to a claimant of `bounty` holding `stake`.
pub fn capped_share(bounty: &Bounty, stake: Balance) -> Option<Share> {
    let proportional = proportional_share(bounty.reward_amount, stake, bounty.total_staked)?;
    Some(Share {
        proportional,
        paid: proportional.min(bounty.remaining_reward()),
    })
}

/// Check every accounting invariant of one bounty against its stake records.
pub fn check_bounty<'a>(
    bounty: &Bounty,
    stakes: impl IntoIterator<Item = (&'a AccountId, &'a StakeRecord)>,
) -> Result<(), InvariantViolation> {
    let summed = stakes
        .into_iter()
        .fold(0 as Balance, |acc, (_, record)| acc.saturating_add(record.staked_amount));

    if summed != bounty.total_staked {
        return Err(InvariantViolation::StakeSumMismatch {
            bounty_id: bounty.id,
            recorded: bounty.total_staked,
            summed,
        });
    }
    if bounty.claimed_reward_amount > bounty.reward_amount {
        return Err(InvariantViolation::OverDistributed {
            bounty_id: bounty.id,
            claimed: bounty.claimed_reward_amount,
            reward: bounty.reward_amount,
        });
    }
    if bounty.has_winner() && bounty.is_cancelled() {
        return Err(InvariantViolation::AwardedAndCancelled(bounty.id));
    }
    if bounty.is_cancelled() && bounty.total_staked != 0 {
        return Err(InvariantViolation::CancelledWithStake {
            bounty_id: bounty.id,
            total_staked: bounty.total_staked,
        });
    }
    if bounty.expires_at <= bounty.created_at {
        return Err(InvariantViolation::ExpiryBeforeCreation(bounty.id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounty(reward: Balance, total_staked: Balance) -> Bounty {
        Bounty {
            id: 7,
            creator: "creator".into(),
            validator_authority: "validator".into(),
            reward_token: "REWARD".into(),
            reward_amount: reward,
            claimed_reward_amount: 0,
            created_at: 0,
            expires_at: 3_600,
            winner: None,
            total_staked,
            cancelled_at: None,
        }
    }

    #[test]
    fn test_exact_split() {
        assert_eq!(proportional_share(1_000, 300, 1_000), Some(300));
        assert_eq!(proportional_share(1_000, 700, 1_000), Some(700));
    }

    #[test]
    fn test_truncation_leaves_residue() {
        let mut b = bounty(1_000, 3);

        let first = capped_share(&b, 1).unwrap();
        assert_eq!(first, Share { proportional: 333, paid: 333 });
        b.claimed_reward_amount += first.paid;

        let second = capped_share(&b, 2).unwrap();
        assert_eq!(second, Share { proportional: 666, paid: 666 });
        b.claimed_reward_amount += second.paid;

        assert_eq!(b.claimed_reward_amount, 999);
        assert_eq!(b.remaining_reward(), 1);
    }

    #[test]
    fn test_cap_at_remaining() {
        let mut b = bounty(100, 10);
        b.claimed_reward_amount = 95;
        let share = capped_share(&b, 9).unwrap();
        assert_eq!(share.proportional, 90);
        assert_eq!(share.paid, 5);
    }

    #[test]
    fn test_large_values_do_not_overflow() {
        let reward = u128::MAX / 2;
        let total = u128::MAX / 4;
        let stake = total / 2;
        let share = proportional_share(reward, stake, total).unwrap();
        assert!(share <= reward);
        assert!(share >= reward / 2 - 1);
    }

    #[test]
    fn test_stake_above_total_is_rejected() {
        assert_eq!(proportional_share(10, 5, 4), None);
        assert_eq!(proportional_share(10, 0, 0), None);
    }

    #[test]
    fn test_check_bounty_detects_sum_mismatch() {
        let b = bounty(1_000, 10);
        let alice: AccountId = "alice".into();
        let record = StakeRecord {
            staked_amount: 4,
            last_staked_at: 1,
            claimed: false,
        };
        let err = check_bounty(&b, [(&alice, &record)]).unwrap_err();
        assert_eq!(
            err,
            InvariantViolation::StakeSumMismatch {
                bounty_id: 7,
                recorded: 10,
                summed: 4,
            }
        );
    }

    #[test]
    fn test_check_bounty_terminal_states_exclusive() {
        let mut b = bounty(1_000, 0);
        b.cancelled_at = Some(4_000);
        assert!(check_bounty(&b, []).is_ok());

        b.winner = Some(crate::types::Winner {
            account: "winner".into(),
            awarded_at: 10,
        });
        assert_eq!(
            check_bounty(&b, []).unwrap_err(),
            InvariantViolation::AwardedAndCancelled(7)
        );
    }
}
