//! Validator authorities
//!
//! Every bounty names one authority: the only account allowed to report its
//! winner. The ledger tells the authority which bounty id it was assigned once
//! the reward is escrowed; if the authority refuses, creation aborts and the
//! reward goes back to the creator.

use std::sync::OnceLock;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{AccountId, BountyId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorityError {
    #[error("authority {account} is already assigned to bounty {bounty_id}")]
    AlreadyAssigned { account: AccountId, bounty_id: BountyId },
    #[error("authority {account} rejected the assignment: {reason}")]
    Rejected { account: AccountId, reason: String },
    #[error("authority {account} unreachable: {reason}")]
    Unreachable { account: AccountId, reason: String },
}

/// Capability handed to the ledger at bounty creation.
pub trait ValidatorAuthority: Send + Sync {
    /// Account that will be allowed to report the winner.
    fn account(&self) -> &AccountId;

    /// Called once, during creation, with the id the bounty will receive.
    fn set_bounty_id(&self, bounty_id: BountyId) -> Result<(), AuthorityError>;
}

/// A plain account acting as validator. Accepts exactly one assignment.
pub struct AccountAuthority {
    account: AccountId,
    assigned: OnceLock<BountyId>,
}

impl AccountAuthority {
    pub fn new(account: AccountId) -> Self {
        Self {
            account,
            assigned: OnceLock::new(),
        }
    }

    pub fn assigned_bounty(&self) -> Option<BountyId> {
        self.assigned.get().copied()
    }
}

impl ValidatorAuthority for AccountAuthority {
    fn account(&self) -> &AccountId {
        &self.account
    }

    fn set_bounty_id(&self, bounty_id: BountyId) -> Result<(), AuthorityError> {
        self.assigned
            .set(bounty_id)
            .map_err(|_| AuthorityError::AlreadyAssigned {
                account: self.account.clone(),
                bounty_id: self.assigned_bounty().unwrap_or(bounty_id),
            })?;
        debug!("Authority {} assigned to bounty {}", self.account, bounty_id);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct AssignmentNotice<'a> {
    bounty_id: BountyId,
    validator_authority: &'a AccountId,
}

/// An external validator service notified over HTTP.
///
/// The assignment is accepted when the service answers the POST with a 2xx
/// status. Uses the blocking client: call only off the async runtime.
pub struct WebhookAuthority {
    account: AccountId,
    url: String,
    timeout: Duration,
}

impl WebhookAuthority {
    pub fn new(account: AccountId, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            account,
            url: url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl ValidatorAuthority for WebhookAuthority {
    fn account(&self) -> &AccountId {
        &self.account
    }

    fn set_bounty_id(&self, bounty_id: BountyId) -> Result<(), AuthorityError> {
        let unreachable = |e: reqwest::Error| AuthorityError::Unreachable {
            account: self.account.clone(),
            reason: e.to_string(),
        };

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(unreachable)?;

        let notice = AssignmentNotice {
            bounty_id,
            validator_authority: &self.account,
        };
        let resp = client
            .post(&self.url)
            .json(&notice)
            .send()
            .map_err(unreachable)?;

        let status = resp.status();
        if status.is_success() {
            info!(
                "Webhook authority {} accepted bounty {}",
                self.account, bounty_id
            );
            Ok(())
        } else {
            let body = resp.text().unwrap_or_else(|_| "Unknown error".into());
            warn!(
                "Webhook authority {} refused bounty {} ({}): {}",
                self.account, bounty_id, status, body
            );
            Err(AuthorityError::Rejected {
                account: self.account.clone(),
                reason: format!("{}: {}", status, body),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_authority_accepts_one_assignment() {
        let authority = AccountAuthority::new("validator".into());
        assert_eq!(authority.assigned_bounty(), None);

        authority.set_bounty_id(3).unwrap();
        assert_eq!(authority.assigned_bounty(), Some(3));

        let err = authority.set_bounty_id(4).unwrap_err();
        assert_eq!(
            err,
            AuthorityError::AlreadyAssigned {
                account: "validator".into(),
                bounty_id: 3,
            }
        );
    }

    #[test]
    fn test_webhook_url_strips_trailing_slash() {
        let authority = WebhookAuthority::new(
            "validator".into(),
            "https://validator.example.com/assign/",
            Duration::from_secs(5),
        );
        assert_eq!(authority.url(), "https://validator.example.com/assign");
        assert_eq!(authority.account().as_str(), "validator");
    }

    #[test]
    fn test_webhook_unreachable() {
        let authority = WebhookAuthority::new(
            "validator".into(),
            "http://127.0.0.1:9/assign",
            Duration::from_millis(200),
        );
        let err = authority.set_bounty_id(0).unwrap_err();
        assert!(matches!(err, AuthorityError::Unreachable { .. }));
    }

    #[test]
    fn test_webhook_times_out_on_silent_service() {
        // Accepts the connection, never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let held = std::thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let authority = WebhookAuthority::new(
            "validator".into(),
            format!("http://{}/assign", addr),
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        let err = authority.set_bounty_id(0).unwrap_err();

        assert!(matches!(err, AuthorityError::Unreachable { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(held.join());
    }
}
