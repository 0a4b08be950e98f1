//! Escrow service
//!
//! Glue between the HTTP surface and the ledger:
//! - authenticates signed requests and turns them into ledger calls
//! - runs ledger operations on the blocking pool (authority webhooks block)
//! - writes the ledger and balances to SQLite after every committed operation
//! - seeds genesis balances into a fresh database, restores otherwise

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{is_valid_ss58_hotkey, Action, AuthError, RequestAuthenticator};
use crate::authority::{AccountAuthority, ValidatorAuthority, WebhookAuthority};
use crate::config::Config;
use crate::error::{ErrorKind, LedgerError};
use crate::events::RecordedEvent;
use crate::ledger::{AwardReceipt, BountyLedger, ClaimReceipt};
use crate::storage::LedgerStore;
use crate::token::BalanceBook;
use crate::types::{AccountId, Balance, BountyId, BountyView, StakeRecord, Timestamp, TokenId};

/// Source of the current unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Settable clock for tests and simulations.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("invalid request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "authentication",
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Ledger(e) => match e.kind() {
                ErrorKind::Authorization => "authorization",
                ErrorKind::Timing => "timing",
                ErrorKind::State => "state",
                ErrorKind::Dependency => "dependency",
                ErrorKind::NotFound => "not_found",
            },
            Self::Internal(_) => "internal",
        }
    }
}

// ============================================================================
// REQUESTS
// ============================================================================

/// Envelope of every mutating request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    /// SS58 hotkey of the caller
    pub caller: String,
    /// Hex sr25519 signature over the signed message
    pub signature: String,
    /// Unix seconds, must be recent
    pub timestamp: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthoritySpec {
    /// The account itself reports the winner.
    Account { account: String },
    /// An external service is notified and the account reports the winner.
    Webhook { account: String, url: String },
}

/// Amounts travel as decimal strings: they exceed what JSON numbers carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBountyPayload {
    pub authority: AuthoritySpec,
    pub reward_token: String,
    pub reward_amount: String,
    pub expires_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakePayload {
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerPayload {
    pub winner: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBounty {
    pub bounty_id: BountyId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelReceipt {
    pub bounty_id: BountyId,
    pub refunded: Balance,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceView {
    pub token: TokenId,
    pub account: AccountId,
    pub amount: Balance,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub custody_account: AccountId,
    pub security_token: TokenId,
    pub request_window_secs: i64,
    pub bounty_count: u64,
    pub event_count: u64,
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, ServiceError> {
    serde_json::from_value(payload.clone()).map_err(|e| ServiceError::BadRequest(e.to_string()))
}

fn parse_amount(field: &str, value: &str) -> Result<Balance, ServiceError> {
    value
        .trim()
        .parse::<Balance>()
        .map_err(|_| ServiceError::BadRequest(format!("{} is not an unsigned integer: {:?}", field, value)))
}

/// Largest timestamp the database can hold.
const MAX_TIMESTAMP: Timestamp = i64::MAX as Timestamp;

fn ledger_time(clock: &dyn Clock) -> Timestamp {
    u64::try_from(clock.now()).unwrap_or(0)
}

fn parse_account(field: &str, value: &str) -> Result<AccountId, ServiceError> {
    if !is_valid_ss58_hotkey(value) {
        return Err(ServiceError::BadRequest(format!("{} is not an SS58 address", field)));
    }
    Ok(AccountId::new(value))
}

// ============================================================================
// SERVICE
// ============================================================================

pub struct EscrowService {
    ledger: Arc<BountyLedger>,
    book: Arc<BalanceBook>,
    store: Arc<LedgerStore>,
    /// Held across each operation and its persist so snapshots land in order
    write_lock: Arc<Mutex<()>>,
    auth: RequestAuthenticator,
    clock: Arc<dyn Clock>,
    request_window_secs: i64,
    webhook_timeout: Duration,
}

impl EscrowService {
    /// Restore the ledger from `store`, or seed genesis balances if it is empty.
    pub fn bootstrap(config: &Config, store: LedgerStore, clock: Arc<dyn Clock>) -> Result<Self> {
        let custody = config.custody_account();
        let security_token = config.security_token();

        let (ledger, book) = if store.is_empty()? {
            let book = Arc::new(BalanceBook::new(custody.clone()));
            let genesis = config.genesis_balances();
            for entry in &genesis {
                book.deposit(&entry.token, &entry.account, entry.amount)
                    .context("Invalid genesis balance")?;
            }
            let ledger = BountyLedger::new(custody, security_token, book.clone());
            store.save(&ledger.snapshot(), &book.entries())?;
            info!("Initialized new ledger with {} genesis balances", genesis.len());
            (ledger, book)
        } else {
            let book = Arc::new(BalanceBook::from_entries(custody.clone(), store.load_balances()?));
            let ledger = BountyLedger::restore(custody, security_token, book.clone(), store.load_snapshot()?)
                .context("Stored ledger is inconsistent")?;
            (ledger, book)
        };

        let service = Self {
            ledger: Arc::new(ledger),
            book,
            store: Arc::new(store),
            write_lock: Arc::new(Mutex::new(())),
            auth: RequestAuthenticator::new(config.auth.request_window_secs),
            clock,
            request_window_secs: config.auth.request_window_secs,
            webhook_timeout: config.authority.webhook_timeout(),
        };
        service.audit_custody();
        Ok(service)
    }

    /// Warn about any token whose custody balance differs from what the ledger owes.
    fn audit_custody(&self) {
        let mut tokens: Vec<TokenId> = self.book.entries().into_iter().map(|e| e.token).collect();
        tokens.dedup();
        for token in tokens {
            let held = self.book.balance_of(&token, self.ledger.custody());
            let owed = self.ledger.escrowed(&token);
            if held < owed {
                warn!("Custody holds {} {} but owes {}", held, token, owed);
            } else if held > owed {
                debug!("Custody holds {} {} of unclaimable residue", held - owed, token);
            }
        }
    }

    fn now(&self) -> i64 {
        self.clock.now()
    }

    fn ledger_now(&self) -> Timestamp {
        ledger_time(self.clock.as_ref())
    }

    /// Run `op` on the blocking pool, then persist the ledger if it committed.
    ///
    /// `op` receives the time read after the write lock is taken, so commits
    /// never carry a time older than one already committed.
    async fn execute<T, F>(&self, op: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&BountyLedger, Timestamp) -> Result<T, LedgerError> + Send + 'static,
    {
        let ledger = self.ledger.clone();
        let book = self.book.clone();
        let store = self.store.clone();
        let write_lock = self.write_lock.clone();
        let clock = self.clock.clone();

        tokio::task::spawn_blocking(move || -> Result<T, ServiceError> {
            let _writer = write_lock.lock();
            let value = op(&ledger, ledger_time(clock.as_ref()))?;
            store.save(&ledger.snapshot(), &book.entries()).map_err(|e| {
                error!("Failed to persist ledger: {:#}", e);
                ServiceError::Internal(format!("ledger not persisted: {:#}", e))
            })?;
            Ok(value)
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("ledger task failed: {}", e)))?
    }

    fn authenticate(&self, action: &Action, request: &SignedRequest) -> Result<AccountId, ServiceError> {
        let caller = self.auth.authenticate(
            action,
            &request.caller,
            &request.signature,
            request.timestamp,
            &request.payload,
            self.now(),
        )?;
        Ok(caller)
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    pub async fn create_bounty(&self, request: SignedRequest) -> Result<CreatedBounty, ServiceError> {
        let creator = self.authenticate(&Action::Create, &request)?;
        let payload: CreateBountyPayload = parse_payload(&request.payload)?;
        let reward_amount = parse_amount("reward_amount", &payload.reward_amount)?;
        if payload.reward_token.trim().is_empty() {
            return Err(ServiceError::BadRequest("reward_token is empty".into()));
        }
        let reward_token = TokenId::new(payload.reward_token.trim());
        if payload.expires_at > MAX_TIMESTAMP {
            return Err(ServiceError::BadRequest(format!(
                "expires_at exceeds {}",
                MAX_TIMESTAMP
            )));
        }

        let authority: Box<dyn ValidatorAuthority> = match payload.authority {
            AuthoritySpec::Account { account } => {
                Box::new(AccountAuthority::new(parse_account("authority.account", &account)?))
            }
            AuthoritySpec::Webhook { account, url } => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(ServiceError::BadRequest("authority.url must be http(s)".into()));
                }
                Box::new(WebhookAuthority::new(
                    parse_account("authority.account", &account)?,
                    url,
                    self.webhook_timeout,
                ))
            }
        };

        let expires_at = payload.expires_at;
        let bounty_id = self
            .execute(move |ledger, now| {
                ledger.create_bounty(
                    &creator,
                    authority.as_ref(),
                    &reward_token,
                    reward_amount,
                    expires_at,
                    now,
                )
            })
            .await?;
        Ok(CreatedBounty { bounty_id })
    }

    pub async fn stake(&self, bounty_id: BountyId, request: SignedRequest) -> Result<StakeRecord, ServiceError> {
        let staker = self.authenticate(&Action::Stake(bounty_id), &request)?;
        let payload: StakePayload = parse_payload(&request.payload)?;
        let amount = parse_amount("amount", &payload.amount)?;

        self.execute(move |ledger, now| ledger.stake_bounty_security(bounty_id, &staker, amount, now))
            .await
    }

    pub async fn set_winner(&self, bounty_id: BountyId, request: SignedRequest) -> Result<AwardReceipt, ServiceError> {
        let caller = self.authenticate(&Action::Winner(bounty_id), &request)?;
        let payload: WinnerPayload = parse_payload(&request.payload)?;
        let winner = parse_account("winner", &payload.winner)?;

        self.execute(move |ledger, now| ledger.set_bounty_winner(bounty_id, &caller, &winner, now))
            .await
    }

    pub async fn claim(&self, bounty_id: BountyId, request: SignedRequest) -> Result<ClaimReceipt, ServiceError> {
        let staker = self.authenticate(&Action::Claim(bounty_id), &request)?;

        self.execute(move |ledger, now| ledger.claim_staked_bounty_reward(bounty_id, &staker, now))
            .await
    }

    pub async fn cancel(&self, bounty_id: BountyId, request: SignedRequest) -> Result<CancelReceipt, ServiceError> {
        let caller = self.authenticate(&Action::Cancel(bounty_id), &request)?;

        let refunded = self
            .execute(move |ledger, now| ledger.cancel_bounty(bounty_id, &caller, now))
            .await?;
        Ok(CancelReceipt { bounty_id, refunded })
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn info(&self) -> ServiceInfo {
        ServiceInfo {
            custody_account: self.ledger.custody().clone(),
            security_token: self.ledger.security_token().clone(),
            request_window_secs: self.request_window_secs,
            bounty_count: self.ledger.bounty_count(),
            event_count: self.ledger.event_count(),
        }
    }

    pub fn bounty_count(&self) -> u64 {
        self.ledger.bounty_count()
    }

    pub fn bounty(&self, bounty_id: BountyId) -> Result<BountyView, ServiceError> {
        Ok(self.ledger.view(bounty_id, self.ledger_now())?)
    }

    pub fn stake_of(&self, bounty_id: BountyId, staker: &str) -> Result<StakeRecord, ServiceError> {
        self.ledger.bounty(bounty_id)?;
        self.ledger
            .stake(bounty_id, &AccountId::new(staker))
            .ok_or_else(|| ServiceError::NotFound(format!("{} has no stake on bounty {}", staker, bounty_id)))
    }

    pub fn events_since(&self, seq: u64) -> Vec<RecordedEvent> {
        self.ledger.events_since(seq)
    }

    pub fn balance(&self, token: &str, account: &str) -> BalanceView {
        let token = TokenId::new(token);
        let account = AccountId::new(account);
        let amount = self.book.balance_of(&token, &account);
        BalanceView { token, account, amount }
    }

    pub fn ledger(&self) -> &BountyLedger {
        &self.ledger
    }
}
