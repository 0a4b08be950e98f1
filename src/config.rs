//! Configuration management
//!
//! Loads configuration from config.toml with support for:
//! - Server binding settings
//! - Custody account and security token of the ledger
//! - Database location
//! - Signed request window and webhook timeouts
//! - Genesis balances seeded into an empty store

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::token::BalanceEntry;
use crate::types::{AccountId, TokenId};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

/// Upper bound on a webhook assignment. Creation holds the ledger for the
/// whole call, so every other write waits at most this long.
pub const MAX_WEBHOOK_TIMEOUT_SECS: u64 = 5;

/// Main configuration structure matching config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Account holding every escrowed reward and stake
    pub custody_account: String,
    /// Token accepted as staked security
    pub security_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "escrow.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// How far in the past a signed request timestamp may lie
    pub request_window_secs: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            request_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Clamped to [`MAX_WEBHOOK_TIMEOUT_SECS`]
    pub webhook_timeout_secs: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            webhook_timeout_secs: 3,
        }
    }
}

impl AuthorityConfig {
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs.clamp(1, MAX_WEBHOOK_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub balances: Vec<GenesisBalance>,
}

/// Initial balance credited when the database is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisBalance {
    pub token: String,
    pub account: String,
    pub amount: u64,
}

impl Config {
    /// Load from `path`, or the embedded defaults if it does not exist
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path).context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            // Use embedded default config
            toml::from_str(DEFAULT_CONFIG).context("Failed to parse default config")
        }
    }

    pub fn custody_account(&self) -> AccountId {
        AccountId::new(self.ledger.custody_account.as_str())
    }

    pub fn security_token(&self) -> TokenId {
        TokenId::new(self.ledger.security_token.as_str())
    }

    pub fn genesis_balances(&self) -> Vec<BalanceEntry> {
        self.genesis
            .balances
            .iter()
            .map(|b| BalanceEntry {
                token: TokenId::new(b.token.as_str()),
                account: AccountId::new(b.account.as_str()),
                amount: u128::from(b.amount),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_default_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.auth.request_window_secs, 300);
        assert!(!config.ledger.custody_account.is_empty());
    }

    #[test]
    fn test_optional_sections_default() {
        let config: Config = toml::from_str(
            r#"
            [server]
            host = "127.0.0.1"
            port = 9000

            [ledger]
            custody_account = "escrow"
            security_token = "SEC"

            [[genesis.balances]]
            token = "SEC"
            account = "alice"
            amount = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.path, "escrow.db");
        assert_eq!(config.authority.webhook_timeout(), Duration::from_secs(3));
        assert_eq!(config.security_token(), TokenId::new("SEC"));
        assert_eq!(
            config.genesis_balances(),
            vec![BalanceEntry {
                token: "SEC".into(),
                account: "alice".into(),
                amount: 500,
            }]
        );
    }

    #[test]
    fn test_webhook_timeout_is_clamped() {
        let slow = AuthorityConfig {
            webhook_timeout_secs: 600,
        };
        assert_eq!(
            slow.webhook_timeout(),
            Duration::from_secs(MAX_WEBHOOK_TIMEOUT_SECS)
        );

        let zero = AuthorityConfig {
            webhook_timeout_secs: 0,
        };
        assert_eq!(zero.webhook_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_falls_back_to_embedded() {
        let config = Config::load_from("/nonexistent/escrow-config.toml").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
    }
}
