//! SQLite persistence for the ledger
//!
//! The ledger is the source of truth while the process runs. After every
//! committed operation the service writes the full ledger state and the
//! token balances back in one transaction, so the file always holds a
//! consistent snapshot to restart from.
//!
//! Amounts are u128 and stored as decimal TEXT.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use crate::events::{LedgerEvent, RecordedEvent};
use crate::ledger::{LedgerSnapshot, StakeEntry};
use crate::token::BalanceEntry;
use crate::types::{AccountId, Balance, Bounty, StakeRecord, TokenId, Winner};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bounties (
    id INTEGER PRIMARY KEY,
    creator TEXT NOT NULL,
    validator_authority TEXT NOT NULL,
    reward_token TEXT NOT NULL,
    reward_amount TEXT NOT NULL,
    claimed_reward_amount TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    winner TEXT,
    awarded_at INTEGER,
    total_staked TEXT NOT NULL,
    cancelled_at INTEGER
);

CREATE TABLE IF NOT EXISTS stakes (
    bounty_id INTEGER NOT NULL,
    staker TEXT NOT NULL,
    staked_amount TEXT NOT NULL,
    last_staked_at INTEGER NOT NULL,
    claimed INTEGER NOT NULL,
    PRIMARY KEY (bounty_id, staker)
);

CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY,
    bounty_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    body TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_bounty ON events(bounty_id);

CREATE TABLE IF NOT EXISTS balances (
    token TEXT NOT NULL,
    account TEXT NOT NULL,
    amount TEXT NOT NULL,
    PRIMARY KEY (token, account)
);

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open ledger database {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("Failed to create ledger schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// True until the first snapshot has been saved.
    pub fn is_empty(&self) -> Result<bool> {
        let conn = self.conn.lock();
        let saved: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'saved_at'", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(saved.is_none())
    }

    /// Write the ledger and balances in one transaction.
    ///
    /// Events are append-only: only those past the last stored sequence
    /// number are inserted.
    pub fn save(&self, snapshot: &LedgerSnapshot, balances: &[BalanceEntry]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO bounties (id, creator, validator_authority, reward_token, reward_amount,
                    claimed_reward_amount, created_at, expires_at, winner, awarded_at, total_staked, cancelled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for b in &snapshot.bounties {
                stmt.execute(params![
                    b.id,
                    b.creator.as_str(),
                    b.validator_authority.as_str(),
                    b.reward_token.as_str(),
                    b.reward_amount.to_string(),
                    b.claimed_reward_amount.to_string(),
                    b.created_at,
                    b.expires_at,
                    b.winner.as_ref().map(|w| w.account.as_str()),
                    b.winner.as_ref().map(|w| w.awarded_at),
                    b.total_staked.to_string(),
                    b.cancelled_at,
                ])
                .with_context(|| format!("Failed to store bounty {}", b.id))?;
            }
        }

        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO stakes (bounty_id, staker, staked_amount, last_staked_at, claimed)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for s in &snapshot.stakes {
                stmt.execute(params![
                    s.bounty_id,
                    s.staker.as_str(),
                    s.record.staked_amount.to_string(),
                    s.record.last_staked_at,
                    s.record.claimed,
                ])?;
            }
        }

        let stored: Option<u64> = tx.query_row("SELECT MAX(seq) FROM events", [], |row| row.get(0))?;
        let next = stored.map_or(0, |seq| seq + 1);
        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (seq, bounty_id, name, body) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for recorded in snapshot.events.iter().filter(|e| e.seq >= next) {
                let body = serde_json::to_string(&recorded.event)?;
                stmt.execute(params![
                    recorded.seq,
                    recorded.event.bounty_id(),
                    recorded.event.name(),
                    body,
                ])?;
            }
        }

        tx.execute("DELETE FROM balances", [])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO balances (token, account, amount) VALUES (?1, ?2, ?3)")?;
            for entry in balances {
                stmt.execute(params![
                    entry.token.as_str(),
                    entry.account.as_str(),
                    entry.amount.to_string(),
                ])?;
            }
        }

        tx.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('saved_at', ?1)",
            params![Utc::now().to_rfc3339()],
        )?;

        tx.commit().context("Failed to commit ledger snapshot")?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<LedgerSnapshot> {
        let conn = self.conn.lock();

        let mut stmt = conn.prepare(
            "SELECT id, creator, validator_authority, reward_token, reward_amount, claimed_reward_amount,
                    created_at, expires_at, winner, awarded_at, total_staked, cancelled_at
             FROM bounties ORDER BY id",
        )?;
        let bounties = stmt
            .query_map([], |row| {
                let winner: Option<String> = row.get(8)?;
                let awarded_at: Option<u64> = row.get(9)?;
                Ok(Bounty {
                    id: row.get(0)?,
                    creator: AccountId::new(row.get::<_, String>(1)?),
                    validator_authority: AccountId::new(row.get::<_, String>(2)?),
                    reward_token: TokenId::new(row.get::<_, String>(3)?),
                    reward_amount: amount(row, 4)?,
                    claimed_reward_amount: amount(row, 5)?,
                    created_at: row.get(6)?,
                    expires_at: row.get(7)?,
                    winner: winner.zip(awarded_at).map(|(account, awarded_at)| Winner {
                        account: AccountId::new(account),
                        awarded_at,
                    }),
                    total_staked: amount(row, 10)?,
                    cancelled_at: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT bounty_id, staker, staked_amount, last_staked_at, claimed
             FROM stakes ORDER BY bounty_id, staker",
        )?;
        let stakes = stmt
            .query_map([], |row| {
                Ok(StakeEntry {
                    bounty_id: row.get(0)?,
                    staker: AccountId::new(row.get::<_, String>(1)?),
                    record: StakeRecord {
                        staked_amount: amount(row, 2)?,
                        last_staked_at: row.get(3)?,
                        claimed: row.get(4)?,
                    },
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare("SELECT seq, body FROM events ORDER BY seq")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, u64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let events = rows
            .into_iter()
            .map(|(seq, body)| {
                let event: LedgerEvent = serde_json::from_str(&body)
                    .with_context(|| format!("Corrupt event {} in ledger database", seq))?;
                Ok(RecordedEvent { seq, event })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(LedgerSnapshot {
            bounties,
            stakes,
            events,
        })
    }

    pub fn load_balances(&self) -> Result<Vec<BalanceEntry>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT token, account, amount FROM balances ORDER BY token, account")?;
        let balances = stmt
            .query_map([], |row| {
                Ok(BalanceEntry {
                    token: TokenId::new(row.get::<_, String>(0)?),
                    account: AccountId::new(row.get::<_, String>(1)?),
                    amount: amount(row, 2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(balances)
    }

    pub fn event_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn amount(row: &Row<'_>, idx: usize) -> rusqlite::Result<Balance> {
    let text: String = row.get(idx)?;
    text.parse::<Balance>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
