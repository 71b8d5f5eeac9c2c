mod accounts;
pub mod catalog;
pub mod executions;
mod ledger;
pub mod types;

use anyhow::Result;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// All marketplace state lives in one SQLite database. The connection mutex
/// is also what serializes ledger check-and-decrement across concurrent
/// executions for the same user.
pub struct Store {
    db: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Connection::open(&db_path)?;
        Self::create_schema(&db)?;
        info!("Store opened at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn db(&self) -> &Arc<Mutex<Connection>> {
        &self.db
    }

    fn create_schema(db: &Connection) -> Result<()> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                publisher_id TEXT NOT NULL,
                name TEXT NOT NULL,
                webhook_url TEXT NOT NULL,
                webhook_secret TEXT NOT NULL,
                price INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'draft',
                platform TEXT,
                input_schema TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS connected_accounts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'connected',
                last_used_at TEXT,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, agent_id, platform)
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS credit_balances (
                account_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS credit_reservations (
                token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                execution_id TEXT,
                amount INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'held',
                created_at TEXT NOT NULL,
                finalized_at TEXT
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS credit_transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT,
                account_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                account_id TEXT,
                input TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                output TEXT,
                error TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                duration_ms INTEGER,
                credits_charged INTEGER NOT NULL DEFAULT 0,
                request_id TEXT NOT NULL
            )",
            [],
        )?;

        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_user ON executions(user_id, started_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_agent ON executions(agent_id, started_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status, started_at)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_execution ON credit_transactions(execution_id)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_transactions_account ON credit_transactions(account_id, id)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_reservations_state ON credit_reservations(state, created_at)",
            [],
        )?;

        Ok(())
    }
}

/// UTC timestamp in RFC 3339. Stored as TEXT; lexicographic order matches
/// chronological order, which the stale-execution sweep relies on.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn parse_rfc3339(value: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

/// Create an in-memory Store for testing. Avoids filesystem side-effects.
#[cfg(test)]
pub fn test_store() -> Store {
    let db = Connection::open_in_memory().expect("open in-memory db");
    Store::create_schema(&db).expect("create schema");
    Store {
        db: Arc::new(Mutex::new(db)),
        db_path: PathBuf::from(":memory:"),
    }
}
