//! Bounty Escrow - Escrowed rewards with staked security
//!
//! A ledger of bounties. Creators escrow a reward; anyone may stake security
//! on an open bounty; the bounty's validator authority reports a winner.
//!
//! # How it works
//!
//! 1. The creator funds a bounty with a reward token and names a validator authority
//! 2. Before expiry, stakers lock the security token against the bounty
//! 3. Before expiry, the validator may report a winner, who receives the reward
//!    and every unit of staked security
//! 4. After expiry without a winner, each staker reclaims its collateral plus
//!    a share of the reward proportional to its stake
//! 5. After expiry with no winner and no stake, the creator may cancel and is refunded
//!
//! # Guarantees
//!
//! - Every operation is all-or-nothing, including its token transfers
//! - Claimed reward never exceeds the reward
//! - A bounty is never both awarded and cancelled
//! - Custody always holds at least what the ledger owes

pub mod auth;
pub mod authority;
pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod payout;
pub mod server;
pub mod service;
pub mod storage;
pub mod token;
pub mod types;

pub use auth::{is_valid_ss58_hotkey, verify_signature};
pub use authority::{AccountAuthority, ValidatorAuthority, WebhookAuthority};
pub use error::{ErrorKind, LedgerError};
pub use events::{LedgerEvent, RecordedEvent};
pub use ledger::{BountyLedger, LedgerSnapshot};
pub use service::EscrowService;
pub use storage::LedgerStore;
pub use token::{BalanceBook, TokenMover};
pub use types::{AccountId, Balance, Bounty, BountyId, StakeRecord, Timestamp, TokenId};
