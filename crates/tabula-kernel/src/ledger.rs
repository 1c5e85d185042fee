//! Durable record of consumed confirmation tokens.
//!
//! A token moves from unknown to consumed exactly once. The insert is
//! conflict-tolerant, so the first writer wins and every later attempt
//! (from this process or another connection to the same file) sees zero
//! changed rows.

use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use serde_json::Value;
use tracing::debug;

use tabula_types::ConfirmAction;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS consumed_confirmations (
    token TEXT PRIMARY KEY,
    action TEXT NOT NULL,
    payload_snapshot TEXT NOT NULL,
    consumed_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_consumed_at ON consumed_confirmations(consumed_at);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One consumed token, for audit.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedConfirmation {
    pub token: String,
    pub action: ConfirmAction,
    pub payload_snapshot: Value,
    pub consumed_at: i64,
}

/// Database handle for the consumed-token ledger.
pub struct ConfirmationLedger {
    conn: Mutex<Connection>,
}

impl ConfirmationLedger {
    /// Open or create the ledger at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory ledger (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record `token` as consumed.
    ///
    /// Returns `true` only for the first use. The payload snapshot is never
    /// read back by the gate; it exists so an operator can see what was
    /// approved.
    pub fn try_consume(
        &self,
        token: &str,
        action: ConfirmAction,
        payload_snapshot: &Value,
        consumed_at: i64,
    ) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO consumed_confirmations (token, action, payload_snapshot, consumed_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(token) DO NOTHING",
            params![
                token,
                action.as_str(),
                payload_snapshot.to_string(),
                consumed_at
            ],
        )?;
        debug!(token, %action, first_use = changed == 1, "confirmation token consumed");
        Ok(changed == 1)
    }

    pub fn is_consumed(&self, token: &str) -> SqliteResult<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM consumed_confirmations WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn get(&self, token: &str) -> SqliteResult<Option<ConsumedConfirmation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, action, payload_snapshot, consumed_at
             FROM consumed_confirmations WHERE token = ?1",
            params![token],
            |row| {
                let action: String = row.get(1)?;
                let action = ConfirmAction::from_str(&action)
                    .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "action".into(), Type::Text))?;
                let snapshot: String = row.get(2)?;
                let payload_snapshot = serde_json::from_str(&snapshot).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                })?;
                Ok(ConsumedConfirmation {
                    token: row.get(0)?,
                    action,
                    payload_snapshot,
                    consumed_at: row.get(3)?,
                })
            },
        )
        .optional()
    }

    /// Drop records consumed before `cutoff` (unix millis).
    ///
    /// A purged token becomes usable again, so only purge past the point
    /// where its grant could still be replayed from history.
    pub fn purge_older_than(&self, cutoff: i64) -> SqliteResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM consumed_confirmations WHERE consumed_at < ?1",
            params![cutoff],
        )?;
        debug!(removed, cutoff, "purged consumed confirmations");
        Ok(removed)
    }

    pub fn len(&self) -> SqliteResult<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM consumed_confirmations", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
    }

    pub fn is_empty(&self) -> SqliteResult<bool> {
        Ok(self.len()? == 0)
    }
}
