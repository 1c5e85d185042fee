//! SQLite persistence for conversation turns.
//!
//! One row per message, keyed by message id. Parts are reconciled before
//! they are stored, so the database only ever holds canonical tool records.
//! A message's `created_at` is fixed by its first insert and never changes;
//! later upserts replace role and parts only.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult, params};
use thiserror::Error;
use tracing::{debug, instrument};

use tabula_types::{Message, MessagePart, Role};

use crate::clock::{Clock, MonotonicStamps, SystemClock};
use crate::reconcile::reconcile;

#[derive(Debug, Error)]
pub enum ConversationError {
    /// A message id already belongs to another conversation.
    #[error("message {message_id} belongs to conversation {owner}, not {requested}")]
    MessageConversationMismatch {
        message_id: String,
        owner: String,
        requested: String,
    },

    #[error("conversation database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("message parts could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ConversationResult<T> = Result<T, ConversationError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    parts TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at, id);
"#;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Counts from one [`ConversationStore::upsert_turns`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub updated: usize,
}

/// Database handle for conversation turns.
pub struct ConversationStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    stamps: MonotonicStamps,
}

impl ConversationStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::with_connection(conn, Arc::new(SystemClock)))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self::with_connection(conn, Arc::new(SystemClock)))
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self {
            conn: Mutex::new(conn),
            clock,
            stamps: MonotonicStamps::new(),
        }
    }

    /// Replace the clock used for generated timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Insert or update every message in one transaction.
    ///
    /// Messages without `created_at` get a generated stamp, strictly
    /// increasing in batch order. Any id owned by a different conversation
    /// aborts the whole batch.
    #[instrument(skip(self, messages), fields(count = messages.len()))]
    pub fn upsert_turns(
        &self,
        conversation_id: &str,
        messages: &[Message],
    ) -> ConversationResult<UpsertSummary> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut summary = UpsertSummary::default();

        for msg in messages {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    params![msg.id],
                    |row| row.get(0),
                )
                .optional()?;

            let parts = serde_json::to_string(&*reconcile(&msg.parts))?;
            let now = self.clock.now_millis();

            match owner {
                Some(owner) if owner != conversation_id => {
                    return Err(ConversationError::MessageConversationMismatch {
                        message_id: msg.id.clone(),
                        owner,
                        requested: conversation_id.to_string(),
                    });
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE messages SET role = ?1, parts = ?2, updated_at = ?3 WHERE id = ?4",
                        params![msg.role.as_str(), parts, now, msg.id],
                    )?;
                    summary.updated += 1;
                }
                None => {
                    let created_at = msg
                        .created_at
                        .unwrap_or_else(|| self.stamps.next(self.clock.as_ref()));
                    tx.execute(
                        "INSERT INTO messages (id, conversation_id, role, parts, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![msg.id, conversation_id, msg.role.as_str(), parts, created_at, now],
                    )?;
                    summary.inserted += 1;
                }
            }
        }

        tx.commit()?;
        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            "conversation turns persisted"
        );
        Ok(summary)
    }

    /// All messages of a conversation, oldest first. Ties break on id.
    pub fn load_turns(&self, conversation_id: &str) -> ConversationResult<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, role, parts, created_at FROM messages
             WHERE conversation_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![conversation_id], |row| {
                let role: String = row.get(1)?;
                let role = Role::from_str(&role)
                    .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "role".into(), Type::Text))?;
                Ok((
                    row.get::<_, String>(0)?,
                    role,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, role, parts, created_at)| -> ConversationResult<Message> {
                let parts: Vec<MessagePart> = serde_json::from_str(&parts)?;
                Ok(Message {
                    id,
                    role,
                    parts,
                    created_at: Some(created_at),
                })
            })
            .collect()
    }

    /// Remove a conversation and all its messages. Returns rows removed.
    pub fn delete_conversation(&self, conversation_id: &str) -> ConversationResult<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        debug!(conversation_id, removed, "conversation deleted");
        Ok(removed)
    }

    pub fn message_count(&self, conversation_id: &str) -> ConversationResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}
