//! Bounty ledger
//!
//! Owns every bounty and stake record and is the only writer of either. Each
//! public operation runs as one atomic transaction:
//!
//! 1. the ledger lock is taken for the whole operation, so concurrent callers
//!    serialize and never see partial state;
//! 2. preconditions are checked and the single-use state (winner, claimed
//!    flag, cancellation) is written before any external call;
//! 3. transfers run through a [`Settlement`] journal; creation funds the
//!    bounty before the validator authority is told its id, so an authority
//!    never learns an id whose funding failed;
//! 4. on any failure the staged state is restored and executed transfers are
//!    reversed; on success the event is appended.
//!
//! A token mover or authority that calls back into the ledger while an
//! operation is executing gets [`LedgerError::Reentrancy`] from every mutating
//! operation. Queries stay available to it.

mod settlement;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::authority::ValidatorAuthority;
use crate::error::LedgerError;
use crate::events::{EventLog, LedgerEvent, RecordedEvent};
use crate::payout::{self, InvariantViolation, Share};
use crate::token::TokenMover;
use crate::types::{
    AccountId, Balance, Bounty, BountyId, BountyView, StakeRecord, Timestamp, TokenId, Winner,
};

use settlement::Settlement;

/// One stake record with its composite key, as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeEntry {
    pub bounty_id: BountyId,
    pub staker: AccountId,
    pub record: StakeRecord,
}

/// Full ledger contents, used for persistence and restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub bounties: Vec<Bounty>,
    pub stakes: Vec<StakeEntry>,
    pub events: Vec<RecordedEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwardReceipt {
    pub bounty_id: BountyId,
    pub winner: AccountId,
    pub reward_amount: Balance,
    /// Staked security paid to the winner on top of the reward.
    pub collateral_forfeited: Balance,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimReceipt {
    pub bounty_id: BountyId,
    pub staker: AccountId,
    pub collateral_returned: Balance,
    pub share: Share,
}

#[derive(Default)]
struct LedgerState {
    bounties: Vec<Bounty>,
    stakes: BTreeMap<(BountyId, AccountId), StakeRecord>,
    events: EventLog,
}

/// Pre-mutation copy of the records an operation touches.
struct Checkpoint {
    bounty: Bounty,
    stake: Option<(AccountId, Option<StakeRecord>)>,
}

impl LedgerState {
    fn bounty(&self, id: BountyId) -> Result<&Bounty, LedgerError> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.bounties.get(i))
            .ok_or(LedgerError::BountyNotFound(id))
    }

    fn bounty_mut(&mut self, id: BountyId) -> Result<&mut Bounty, LedgerError> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.bounties.get_mut(i))
            .ok_or(LedgerError::BountyNotFound(id))
    }

    fn stakes_of(&self, id: BountyId) -> impl Iterator<Item = (&AccountId, &StakeRecord)> {
        self.stakes
            .range((id, AccountId::new(String::new()))..)
            .take_while(move |((bounty_id, _), _)| *bounty_id == id)
            .map(|((_, staker), record)| (staker, record))
    }

    fn checkpoint(&self, id: BountyId, staker: Option<&AccountId>) -> Result<Checkpoint, LedgerError> {
        Ok(Checkpoint {
            bounty: self.bounty(id)?.clone(),
            stake: staker.map(|s| (s.clone(), self.stakes.get(&(id, s.clone())).cloned())),
        })
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        let id = checkpoint.bounty.id;
        if let Some((staker, previous)) = checkpoint.stake {
            match previous {
                Some(record) => {
                    self.stakes.insert((id, staker), record);
                }
                None => {
                    self.stakes.remove(&(id, staker));
                }
            }
        }
        if let Ok(slot) = self.bounty_mut(id) {
            *slot = checkpoint.bounty;
        }
    }

    fn check_invariants(&self) -> Result<(), InvariantViolation> {
        for bounty in &self.bounties {
            payout::check_bounty(bounty, self.stakes_of(bounty.id))?;
        }
        Ok(())
    }
}

struct Inner {
    state: RefCell<LedgerState>,
    in_flight: Cell<bool>,
}

/// Marks the ledger busy for the lifetime of one mutating operation.
struct Operation<'a> {
    in_flight: &'a Cell<bool>,
}

impl<'a> Operation<'a> {
    fn begin(inner: &'a Inner) -> Result<Self, LedgerError> {
        if inner.in_flight.replace(true) {
            debug!("Rejected re-entrant ledger call");
            return Err(LedgerError::Reentrancy);
        }
        Ok(Self {
            in_flight: &inner.in_flight,
        })
    }
}

impl Drop for Operation<'_> {
    fn drop(&mut self) {
        self.in_flight.set(false);
    }
}

pub struct BountyLedger {
    custody: AccountId,
    security_token: TokenId,
    tokens: Arc<dyn TokenMover>,
    inner: ReentrantMutex<Inner>,
}

impl BountyLedger {
    /// Empty ledger holding funds in `custody`, accepting stakes in `security_token`.
    pub fn new(custody: AccountId, security_token: TokenId, tokens: Arc<dyn TokenMover>) -> Self {
        Self::with_state(custody, security_token, tokens, LedgerState::default())
    }

    /// Rebuild a ledger from a snapshot, refusing one that breaks an invariant.
    pub fn restore(
        custody: AccountId,
        security_token: TokenId,
        tokens: Arc<dyn TokenMover>,
        snapshot: LedgerSnapshot,
    ) -> Result<Self, InvariantViolation> {
        let mut state = LedgerState::default();

        for (position, bounty) in snapshot.bounties.into_iter().enumerate() {
            let position = position as u64;
            if bounty.id != position {
                return Err(InvariantViolation::IdOutOfSequence {
                    position,
                    id: bounty.id,
                });
            }
            state.bounties.push(bounty);
        }

        for entry in snapshot.stakes {
            if state.bounty(entry.bounty_id).is_err() {
                return Err(InvariantViolation::OrphanStake(entry.bounty_id));
            }
            state
                .stakes
                .insert((entry.bounty_id, entry.staker), entry.record);
        }

        state.events = EventLog::from_entries(snapshot.events).ok_or(InvariantViolation::EventGap)?;
        state.check_invariants()?;

        info!(
            "Restored ledger with {} bounties and {} stake records",
            state.bounties.len(),
            state.stakes.len()
        );
        Ok(Self::with_state(custody, security_token, tokens, state))
    }

    fn with_state(
        custody: AccountId,
        security_token: TokenId,
        tokens: Arc<dyn TokenMover>,
        state: LedgerState,
    ) -> Self {
        Self {
            custody,
            security_token,
            tokens,
            inner: ReentrantMutex::new(Inner {
                state: RefCell::new(state),
                in_flight: Cell::new(false),
            }),
        }
    }

    pub fn custody(&self) -> &AccountId {
        &self.custody
    }

    pub fn security_token(&self) -> &TokenId {
        &self.security_token
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Create and fully fund a bounty. Returns its id.
    pub fn create_bounty(
        &self,
        creator: &AccountId,
        authority: &dyn ValidatorAuthority,
        reward_token: &TokenId,
        reward_amount: Balance,
        expires_at: Timestamp,
        now: Timestamp,
    ) -> Result<BountyId, LedgerError> {
        let guard = self.inner.lock();
        let _op = Operation::begin(&guard)?;

        if expires_at <= now {
            debug!("Rejected bounty expiring at {} (now {})", expires_at, now);
            return Err(LedgerError::ExpiryNotInFuture { expires_at, now });
        }

        let bounty_id = guard.state.borrow().bounties.len() as BountyId;

        let mut settlement = Settlement::new(self.tokens.as_ref(), &self.custody);
        settlement.pull(reward_token, creator, reward_amount)?;

        // A rejected assignment drops the settlement, which returns the reward.
        authority
            .set_bounty_id(bounty_id)
            .map_err(|source| LedgerError::Authority { bounty_id, source })?;

        let bounty = Bounty {
            id: bounty_id,
            creator: creator.clone(),
            validator_authority: authority.account().clone(),
            reward_token: reward_token.clone(),
            reward_amount,
            claimed_reward_amount: 0,
            created_at: now,
            expires_at,
            winner: None,
            total_staked: 0,
            cancelled_at: None,
        };

        let mut state = guard.state.borrow_mut();
        state.bounties.push(bounty);
        state.events.append(LedgerEvent::BountyCreated {
            creator: creator.clone(),
            bounty_id,
            validator_authority: authority.account().clone(),
            reward_token: reward_token.clone(),
            reward_amount,
            created_at: now,
            expires_at,
        });
        settlement.commit();

        info!(
            "Created bounty {} by {} ({} {}, expires {}, validator {})",
            bounty_id,
            creator,
            reward_amount,
            reward_token,
            expires_at,
            authority.account()
        );
        Ok(bounty_id)
    }

    /// Lock `amount` of the security token against an open bounty.
    pub fn stake_bounty_security(
        &self,
        bounty_id: BountyId,
        staker: &AccountId,
        amount: Balance,
        now: Timestamp,
    ) -> Result<StakeRecord, LedgerError> {
        let guard = self.inner.lock();
        let _op = Operation::begin(&guard)?;

        let (checkpoint, record, bounty_total) = {
            let mut state = guard.state.borrow_mut();
            let bounty = state.bounty(bounty_id)?;

            if amount == 0 {
                return Err(LedgerError::ZeroAmount);
            }
            if bounty.is_cancelled() {
                return Err(LedgerError::BountyCancelled(bounty_id));
            }
            if !bounty.is_open_at(now) {
                debug!("Rejected stake on expired bounty {}", bounty_id);
                return Err(LedgerError::BountyExpired {
                    bounty_id,
                    expires_at: bounty.expires_at,
                });
            }
            if bounty.has_winner() {
                return Err(LedgerError::WinnerAlreadySet(bounty_id));
            }

            let bounty_total = bounty
                .total_staked
                .checked_add(amount)
                .ok_or(LedgerError::Overflow("bounty total stake"))?;
            let mut record = state
                .stakes
                .get(&(bounty_id, staker.clone()))
                .cloned()
                .unwrap_or_default();
            record.staked_amount = record
                .staked_amount
                .checked_add(amount)
                .ok_or(LedgerError::Overflow("staker total stake"))?;
            record.last_staked_at = now;

            let checkpoint = state.checkpoint(bounty_id, Some(staker))?;
            state.bounty_mut(bounty_id)?.total_staked = bounty_total;
            state
                .stakes
                .insert((bounty_id, staker.clone()), record.clone());
            (checkpoint, record, bounty_total)
        };

        let mut settlement = Settlement::new(self.tokens.as_ref(), &self.custody);
        if let Err(e) = settlement.pull(&self.security_token, staker, amount) {
            guard.state.borrow_mut().restore(checkpoint);
            return Err(e.into());
        }

        guard
            .state
            .borrow_mut()
            .events
            .append(LedgerEvent::BountySecurityStaked {
                bounty_id,
                staker: staker.clone(),
                stake_delta: amount,
                staker_total_staked: record.staked_amount,
                bounty_total_staked: bounty_total,
                staked_at: now,
            });
        settlement.commit();

        info!(
            "{} staked {} on bounty {} (staker total {}, bounty total {})",
            staker, amount, bounty_id, record.staked_amount, bounty_total
        );
        Ok(record)
    }

    /// Report the winner. Only the bounty's validator authority, only before expiry.
    ///
    /// The winner receives the full reward and, in one transfer, every unit of
    /// security staked on the bounty.
    pub fn set_bounty_winner(
        &self,
        bounty_id: BountyId,
        caller: &AccountId,
        winner: &AccountId,
        now: Timestamp,
    ) -> Result<AwardReceipt, LedgerError> {
        let guard = self.inner.lock();
        let _op = Operation::begin(&guard)?;

        let (checkpoint, bounty) = {
            let mut state = guard.state.borrow_mut();
            let bounty = state.bounty(bounty_id)?;

            if &bounty.validator_authority != caller {
                debug!("{} is not the validator of bounty {}", caller, bounty_id);
                return Err(LedgerError::NotValidatorAuthority {
                    bounty_id,
                    caller: caller.clone(),
                });
            }
            if bounty.is_cancelled() {
                return Err(LedgerError::BountyCancelled(bounty_id));
            }
            if !bounty.is_open_at(now) {
                return Err(LedgerError::BountyExpired {
                    bounty_id,
                    expires_at: bounty.expires_at,
                });
            }
            if bounty.has_winner() {
                return Err(LedgerError::WinnerAlreadySet(bounty_id));
            }

            let checkpoint = state.checkpoint(bounty_id, None)?;
            let bounty = state.bounty_mut(bounty_id)?;
            bounty.winner = Some(Winner {
                account: winner.clone(),
                awarded_at: now,
            });
            (checkpoint, bounty.clone())
        };

        let mut settlement = Settlement::new(self.tokens.as_ref(), &self.custody);
        let paid = settlement
            .pay(&bounty.reward_token, winner, bounty.reward_amount)
            .and_then(|_| {
                if bounty.total_staked > 0 {
                    settlement.pay(&self.security_token, winner, bounty.total_staked)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = paid {
            guard.state.borrow_mut().restore(checkpoint);
            return Err(e.into());
        }

        guard
            .state
            .borrow_mut()
            .events
            .append(LedgerEvent::BountyAwarded {
                winner: winner.clone(),
                bounty_id,
                timestamp: now,
                reward_token: bounty.reward_token.clone(),
                reward_amount: bounty.reward_amount,
                total_staked_at_award: bounty.total_staked,
            });
        settlement.commit();

        info!(
            "Bounty {} awarded to {} ({} {} + {} forfeited security)",
            bounty_id, winner, bounty.reward_amount, bounty.reward_token, bounty.total_staked
        );
        Ok(AwardReceipt {
            bounty_id,
            winner: winner.clone(),
            reward_amount: bounty.reward_amount,
            collateral_forfeited: bounty.total_staked,
        })
    }

    /// Return the caller's collateral and proportional reward share after an
    /// expiry without a winner.
    pub fn claim_staked_bounty_reward(
        &self,
        bounty_id: BountyId,
        staker: &AccountId,
        now: Timestamp,
    ) -> Result<ClaimReceipt, LedgerError> {
        let guard = self.inner.lock();
        let _op = Operation::begin(&guard)?;

        let (checkpoint, bounty, collateral, share) = {
            let mut state = guard.state.borrow_mut();
            let bounty = state.bounty(bounty_id)?;

            if bounty.is_cancelled() {
                return Err(LedgerError::BountyCancelled(bounty_id));
            }
            if bounty.has_winner() {
                return Err(LedgerError::WinnerAlreadySet(bounty_id));
            }
            if !bounty.is_expired_at(now) {
                debug!("Rejected claim on bounty {} before expiry", bounty_id);
                return Err(LedgerError::BountyNotExpired {
                    bounty_id,
                    expires_at: bounty.expires_at,
                });
            }

            let record = state
                .stakes
                .get(&(bounty_id, staker.clone()))
                .cloned()
                .unwrap_or_default();
            if record.staked_amount == 0 {
                return Err(LedgerError::NothingStaked {
                    bounty_id,
                    staker: staker.clone(),
                });
            }
            if record.claimed {
                return Err(LedgerError::AlreadyClaimed {
                    bounty_id,
                    staker: staker.clone(),
                });
            }

            let share = payout::capped_share(bounty, record.staked_amount)
                .ok_or(LedgerError::Overflow("reward share"))?;
            let claimed_total = bounty
                .claimed_reward_amount
                .checked_add(share.paid)
                .ok_or(LedgerError::Overflow("claimed reward"))?;

            let checkpoint = state.checkpoint(bounty_id, Some(staker))?;
            if let Some(slot) = state.stakes.get_mut(&(bounty_id, staker.clone())) {
                slot.claimed = true;
            }
            let bounty = state.bounty_mut(bounty_id)?;
            bounty.claimed_reward_amount = claimed_total;
            (checkpoint, bounty.clone(), record.staked_amount, share)
        };

        let mut settlement = Settlement::new(self.tokens.as_ref(), &self.custody);
        let paid = settlement
            .pay(&self.security_token, staker, collateral)
            .and_then(|_| settlement.pay(&bounty.reward_token, staker, share.paid));
        if let Err(e) = paid {
            guard.state.borrow_mut().restore(checkpoint);
            return Err(e.into());
        }

        guard
            .state
            .borrow_mut()
            .events
            .append(LedgerEvent::BountyStakeClaimed {
                bounty_id,
                staker: staker.clone(),
                collateral_returned: collateral,
                reward_share: share.paid,
                claimed_reward_total: bounty.claimed_reward_amount,
                claimed_at: now,
            });
        settlement.commit();

        info!(
            "{} claimed {} security + {} {} from bounty {} ({} of {} distributed)",
            staker,
            collateral,
            share.paid,
            bounty.reward_token,
            bounty_id,
            bounty.claimed_reward_amount,
            bounty.reward_amount
        );
        Ok(ClaimReceipt {
            bounty_id,
            staker: staker.clone(),
            collateral_returned: collateral,
            share,
        })
    }

    /// Refund the reward to the creator of an expired bounty nobody staked on.
    pub fn cancel_bounty(
        &self,
        bounty_id: BountyId,
        caller: &AccountId,
        now: Timestamp,
    ) -> Result<Balance, LedgerError> {
        let guard = self.inner.lock();
        let _op = Operation::begin(&guard)?;

        let (checkpoint, bounty) = {
            let mut state = guard.state.borrow_mut();
            let bounty = state.bounty(bounty_id)?;

            if &bounty.creator != caller {
                debug!("{} is not the creator of bounty {}", caller, bounty_id);
                return Err(LedgerError::NotCreator {
                    bounty_id,
                    caller: caller.clone(),
                });
            }
            if bounty.is_cancelled() {
                return Err(LedgerError::BountyCancelled(bounty_id));
            }
            if bounty.has_winner() {
                return Err(LedgerError::WinnerAlreadySet(bounty_id));
            }
            if !bounty.is_expired_at(now) {
                return Err(LedgerError::BountyNotExpired {
                    bounty_id,
                    expires_at: bounty.expires_at,
                });
            }
            if bounty.total_staked > 0 {
                return Err(LedgerError::BountyHasStakes {
                    bounty_id,
                    total_staked: bounty.total_staked,
                });
            }

            let checkpoint = state.checkpoint(bounty_id, None)?;
            let bounty = state.bounty_mut(bounty_id)?;
            bounty.cancelled_at = Some(now);
            (checkpoint, bounty.clone())
        };

        let mut settlement = Settlement::new(self.tokens.as_ref(), &self.custody);
        if let Err(e) = settlement.pay(&bounty.reward_token, &bounty.creator, bounty.reward_amount) {
            guard.state.borrow_mut().restore(checkpoint);
            return Err(e.into());
        }

        guard
            .state
            .borrow_mut()
            .events
            .append(LedgerEvent::BountyCancelled {
                bounty_id,
                creator: bounty.creator.clone(),
                cancelled_at: now,
            });
        settlement.commit();

        info!(
            "Bounty {} cancelled, {} {} returned to {}",
            bounty_id, bounty.reward_amount, bounty.reward_token, bounty.creator
        );
        Ok(bounty.reward_amount)
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn bounty_count(&self) -> u64 {
        let guard = self.inner.lock();
        let count = guard.state.borrow().bounties.len() as u64;
        count
    }

    pub fn bounty(&self, bounty_id: BountyId) -> Result<Bounty, LedgerError> {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        state.bounty(bounty_id).cloned()
    }

    /// Bounty record with its status as of `now`.
    pub fn view(&self, bounty_id: BountyId, now: Timestamp) -> Result<BountyView, LedgerError> {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        let bounty = state.bounty(bounty_id)?;
        Ok(BountyView {
            status: bounty.status(now),
            stakers: state.stakes_of(bounty_id).count(),
            bounty: bounty.clone(),
        })
    }

    pub fn stake(&self, bounty_id: BountyId, staker: &AccountId) -> Option<StakeRecord> {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        state.stakes.get(&(bounty_id, staker.clone())).cloned()
    }

    pub fn stakes(&self, bounty_id: BountyId) -> Vec<(AccountId, StakeRecord)> {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        state
            .stakes_of(bounty_id)
            .map(|(staker, record)| (staker.clone(), record.clone()))
            .collect()
    }

    pub fn event_count(&self) -> u64 {
        let guard = self.inner.lock();
        let count = guard.state.borrow().events.len() as u64;
        count
    }

    pub fn events_since(&self, seq: u64) -> Vec<RecordedEvent> {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        state.events.since(seq).to_vec()
    }

    /// Amount of `token` the custody account must hold for every open
    /// obligation: undistributed reward of unresolved bounties and unclaimed
    /// stake of bounties without a winner.
    pub fn escrowed(&self, token: &TokenId) -> Balance {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        state
            .bounties
            .iter()
            .filter(|b| !b.has_winner() && !b.is_cancelled())
            .fold(0 as Balance, |acc, b| {
                let mut held = acc;
                if &b.reward_token == token {
                    held = held.saturating_add(b.remaining_reward());
                }
                if token == &self.security_token {
                    held = state
                        .stakes_of(b.id)
                        .filter(|(_, r)| !r.claimed)
                        .fold(held, |h, (_, r)| h.saturating_add(r.staked_amount));
                }
                held
            })
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        state.check_invariants()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let guard = self.inner.lock();
        let state = guard.state.borrow();
        LedgerSnapshot {
            bounties: state.bounties.clone(),
            stakes: state
                .stakes
                .iter()
                .map(|((bounty_id, staker), record)| StakeEntry {
                    bounty_id: *bounty_id,
                    staker: staker.clone(),
                    record: record.clone(),
                })
                .collect(),
            events: state.events.iter().cloned().collect(),
        }
    }
}
