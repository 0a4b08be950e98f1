//! Request authentication
//!
//! - SS58 hotkey validation
//! - Sr25519 signature verification
//! - Signed request envelopes with replay protection
//!
//! Every mutating request is signed by its caller over
//! `<action>:<sha256(payload JSON) hex>:<unix timestamp>`. The verified hotkey
//! becomes the caller identity handed to the ledger.
//!
//! The payload is hashed in canonical form: compact JSON with no whitespace
//! and the keys of every object sorted bytewise, at every depth. Strings use
//! serde_json's escaping. A client that serializes the same way, for example
//! `{"amount":"100"}`, reproduces the digest whatever key order it sent.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use sp_core::crypto::Ss58Codec;
use sp_core::sr25519::{Public, Signature};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::types::{AccountId, BountyId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("caller is not a valid SS58 hotkey")]
    InvalidHotkey,
    #[error("request timestamp {0} is outside the accepted window")]
    StaleTimestamp(i64),
    #[error("signature does not match caller")]
    BadSignature,
    #[error("signature was already used")]
    Replayed,
}

/// Check if a string is a valid SS58-encoded sr25519 public key
pub fn is_valid_ss58_hotkey(hotkey: &str) -> bool {
    if hotkey.len() < 40 || hotkey.len() > 60 {
        return false;
    }
    Public::from_ss58check(hotkey).is_ok()
}

/// Verify an sr25519 signature
pub fn verify_signature(hotkey: &str, message: &str, signature_hex: &str) -> bool {
    let public_key = match Public::from_ss58check(hotkey) {
        Ok(pk) => pk,
        Err(e) => {
            debug!("Failed to parse SS58 hotkey: {}", e);
            return false;
        }
    };

    let sig_hex = signature_hex
        .strip_prefix("0x")
        .unwrap_or(signature_hex)
        .to_lowercase();

    let sig_bytes = match hex::decode(&sig_hex) {
        Ok(b) => b,
        Err(e) => {
            debug!("Failed to decode signature hex: {}", e);
            return false;
        }
    };

    let sig_array: [u8; 64] = match sig_bytes.as_slice().try_into() {
        Ok(a) => a,
        Err(_) => {
            debug!("Invalid signature length: {} (expected 64)", sig_bytes.len());
            return false;
        }
    };
    let signature = Signature::from_raw(sig_array);

    use sp_core::Pair;
    sp_core::sr25519::Pair::verify(&signature, message.as_bytes(), &public_key)
}

/// Action names bound into signed messages.
pub enum Action {
    Create,
    Stake(BountyId),
    Winner(BountyId),
    Claim(BountyId),
    Cancel(BountyId),
}

impl Action {
    pub fn label(&self) -> String {
        match self {
            Self::Create => "create".to_string(),
            Self::Stake(id) => format!("stake:{}", id),
            Self::Winner(id) => format!("winner:{}", id),
            Self::Claim(id) => format!("claim:{}", id),
            Self::Cancel(id) => format!("cancel:{}", id),
        }
    }
}

/// Hex SHA-256 of the canonical (compact, sorted-key) JSON encoding of `payload`.
pub fn payload_digest(payload: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Create the message a caller signs for `action`
pub fn create_signed_message(action: &Action, payload: &serde_json::Value, timestamp: i64) -> String {
    format!("{}:{}:{}", action.label(), payload_digest(payload), timestamp)
}

/// Only allows past timestamps within the window
pub fn is_timestamp_valid(timestamp: i64, now: i64, window_secs: i64) -> bool {
    timestamp <= now && (now - timestamp) < window_secs
}

/// Remembers signatures seen within the timestamp window.
pub struct ReplayGuard {
    window_secs: i64,
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayGuard {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `signature`. Returns false if it was already used.
    pub fn check_and_record(&self, signature: &str, now: i64) -> bool {
        let key = signature.to_lowercase();
        let mut seen = self.seen.lock();
        seen.retain(|_, at| now - *at < self.window_secs);
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        true
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RequestAuthenticator {
    window_secs: i64,
    replay: ReplayGuard,
}

impl RequestAuthenticator {
    pub fn new(window_secs: i64) -> Self {
        Self {
            window_secs,
            replay: ReplayGuard::new(window_secs),
        }
    }

    /// Verify a signed request and return the caller's account.
    pub fn authenticate(
        &self,
        action: &Action,
        caller: &str,
        signature: &str,
        timestamp: i64,
        payload: &serde_json::Value,
        now: i64,
    ) -> Result<AccountId, AuthError> {
        if !is_valid_ss58_hotkey(caller) {
            return Err(AuthError::InvalidHotkey);
        }
        if !is_timestamp_valid(timestamp, now, self.window_secs) {
            return Err(AuthError::StaleTimestamp(timestamp));
        }
        let message = create_signed_message(action, payload, timestamp);
        if !verify_signature(caller, &message, signature) {
            return Err(AuthError::BadSignature);
        }
        let normalized = signature.strip_prefix("0x").unwrap_or(signature).to_lowercase();
        if !self.replay.check_and_record(&normalized, now) {
            debug!("Replayed signature from {}", caller);
            return Err(AuthError::Replayed);
        }
        Ok(AccountId::new(caller))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use sp_core::{sr25519, Pair};

    pub fn keypair(seed: &str) -> sr25519::Pair {
        sr25519::Pair::from_string(seed, None).unwrap()
    }

    pub fn hotkey(pair: &sr25519::Pair) -> String {
        pair.public().to_ss58check()
    }

    pub fn sign(pair: &sr25519::Pair, action: &Action, payload: &serde_json::Value, timestamp: i64) -> String {
        let message = create_signed_message(action, payload, timestamp);
        hex::encode(pair.sign(message.as_bytes()))
    }
}
