//! SQLite storage layer for the conversation cache.
//!
//! Persists conversations, per-conversation message lists, the offline
//! outgoing queue, tunable cache settings, and last-sync timestamps in a
//! single database that both the library and CLI share.  Cache bounds
//! (conversation count, messages per conversation, retention window) are
//! enforced by [`Storage::enforce_bounds`], which callers invoke after every
//! batch save.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    Serde(serde_json::Error),
    NotFound(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
            StorageError::Serde(e) => write!(f, "serialization error: {e}"),
            StorageError::NotFound(msg) => write!(f, "not found: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serde(e)
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

/// Conversation row stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    pub contact_name: Option<String>,
    pub phone: Option<String>,
    /// Timestamp of the newest message, used for ordering and pruning.
    pub last_message_time: u64,
    /// Preview text of the newest message.
    pub last_message: Option<String>,
    pub unread_count: u32,
    pub updated_at: u64,
}

/// Message row stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: u64,
    /// "sent", "delivered", "read", "queued", "failed"
    pub status: String,
    pub received_at: u64,
}

/// Outgoing-queue row for messages composed while offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub local_id: String,
    pub conversation_id: String,
    pub content: String,
    pub queued_at: u64,
}

/// Tunable cache settings, persisted in the `settings` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    pub max_conversations: u32,
    pub max_messages_per_conversation: u32,
    pub retention_days: u32,
    pub sync_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_conversations: 50,
            max_messages_per_conversation: 200,
            retention_days: 30,
            sync_interval_secs: 30,
        }
    }
}

/// Counts of rows removed by a bounds-enforcement pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PruneReport {
    pub conversations_pruned: usize,
    pub messages_pruned: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.conversations_pruned == 0 && self.messages_pruned == 0
    }
}

// ---------------------------------------------------------------------------
// Storage handle
// ---------------------------------------------------------------------------

/// Main storage handle wrapping a SQLite connection.
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open or create a database at the given path. Creates schema if needed.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    /// Create an in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let storage = Self { conn };
        storage.create_schema()?;
        Ok(storage)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id   TEXT PRIMARY KEY,
                contact_name      TEXT,
                phone             TEXT,
                last_message_time INTEGER NOT NULL DEFAULT 0,
                last_message      TEXT,
                unread_count      INTEGER NOT NULL DEFAULT 0,
                updated_at        INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_conversations_last_time
                ON conversations(last_message_time);

            CREATE TABLE IF NOT EXISTS messages (
                message_id      TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                sender          TEXT NOT NULL,
                content         TEXT NOT NULL,
                timestamp       INTEGER NOT NULL,
                status          TEXT NOT NULL,
                received_at     INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_time
                ON messages(timestamp);

            CREATE TABLE IF NOT EXISTS outbox (
                local_id        TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                content         TEXT NOT NULL,
                queued_at       INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key     TEXT PRIMARY KEY,
                value   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_state (
                key     TEXT PRIMARY KEY,
                value   INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Conversations CRUD
    // -----------------------------------------------------------------------

    pub fn upsert_conversation(&self, row: &ConversationRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO conversations
             (conversation_id, contact_name, phone, last_message_time,
              last_message, unread_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.conversation_id,
                row.contact_name,
                row.phone,
                row.last_message_time as i64,
                row.last_message,
                row.unread_count as i64,
                row.updated_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, contact_name, phone, last_message_time,
                    last_message, unread_count, updated_at
             FROM conversations WHERE conversation_id = ?1",
        )?;
        let row = stmt
            .query_row(params![conversation_id], |row| {
                Ok(ConversationRow {
                    conversation_id: row.get(0)?,
                    contact_name: row.get(1)?,
                    phone: row.get(2)?,
                    last_message_time: row.get::<_, i64>(3)? as u64,
                    last_message: row.get(4)?,
                    unread_count: row.get::<_, i64>(5)? as u32,
                    updated_at: row.get::<_, i64>(6)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// List all conversations, newest activity first.
    pub fn list_conversations(&self) -> Result<Vec<ConversationRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT conversation_id, contact_name, phone, last_message_time,
                    last_message, unread_count, updated_at
             FROM conversations ORDER BY last_message_time DESC, conversation_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ConversationRow {
                conversation_id: row.get(0)?,
                contact_name: row.get(1)?,
                phone: row.get(2)?,
                last_message_time: row.get::<_, i64>(3)? as u64,
                last_message: row.get(4)?,
                unread_count: row.get::<_, i64>(5)? as u32,
                updated_at: row.get::<_, i64>(6)? as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    /// Delete a conversation and its cached messages.  Pending outbox entries
    /// for the conversation are kept.
    pub fn delete_conversation(&self, conversation_id: &str) -> Result<bool, StorageError> {
        self.conn.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let affected = self.conn.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(affected > 0)
    }

    /// Zero the unread counter and mark the conversation's delivered messages
    /// as read.
    pub fn mark_conversation_read(&self, conversation_id: &str) -> Result<bool, StorageError> {
        self.conn.execute(
            "UPDATE messages SET status = 'read'
             WHERE conversation_id = ?1 AND status = 'delivered'",
            params![conversation_id],
        )?;
        let affected = self.conn.execute(
            "UPDATE conversations SET unread_count = 0 WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(affected > 0)
    }

    /// Bump a conversation's last-message fields after an outgoing send.
    /// Creates a minimal conversation row if none exists yet.
    pub fn touch_conversation(
        &self,
        conversation_id: &str,
        timestamp: u64,
        preview: &str,
    ) -> Result<(), StorageError> {
        let now = now_secs();
        match self.get_conversation(conversation_id)? {
            Some(mut conv) => {
                if timestamp >= conv.last_message_time {
                    conv.last_message_time = timestamp;
                    conv.last_message = Some(preview.to_string());
                }
                conv.updated_at = now;
                self.upsert_conversation(&conv)
            }
            None => self.upsert_conversation(&ConversationRow {
                conversation_id: conversation_id.to_string(),
                contact_name: None,
                phone: None,
                last_message_time: timestamp,
                last_message: Some(preview.to_string()),
                unread_count: 0,
                updated_at: now,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Messages CRUD
    // -----------------------------------------------------------------------

    pub fn insert_message(&self, row: &MessageRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO messages
             (message_id, conversation_id, sender, content, timestamp, status, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.message_id,
                row.conversation_id,
                row.sender,
                row.content,
                row.timestamp as i64,
                row.status,
                row.received_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, message_id: &str) -> Result<Option<MessageRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT message_id, conversation_id, sender, content, timestamp, status, received_at
             FROM messages WHERE message_id = ?1",
        )?;
        let row = stmt
            .query_row(params![message_id], |row| {
                Ok(MessageRow {
                    message_id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: row.get::<_, i64>(4)? as u64,
                    status: row.get(5)?,
                    received_at: row.get::<_, i64>(6)? as u64,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn has_message(&self, message_id: &str) -> Result<bool, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE message_id = ?1",
            params![message_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// List a conversation's messages in chronological order.
    pub fn list_conversation_messages(
        &self,
        conversation_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<MessageRow>, StorageError> {
        // When limited, the newest N messages are wanted, still returned in
        // ascending order.
        let sql = if limit.is_some() {
            "SELECT message_id, conversation_id, sender, content, timestamp, status, received_at
             FROM (SELECT * FROM messages WHERE conversation_id = ?1
                   ORDER BY timestamp DESC, message_id LIMIT ?2)
             ORDER BY timestamp ASC, message_id"
        } else {
            "SELECT message_id, conversation_id, sender, content, timestamp, status, received_at
             FROM messages WHERE conversation_id = ?1
             ORDER BY timestamp ASC, message_id"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok(MessageRow {
                message_id: row.get(0)?,
                conversation_id: row.get(1)?,
                sender: row.get(2)?,
                content: row.get(3)?,
                timestamp: row.get::<_, i64>(4)? as u64,
                status: row.get(5)?,
                received_at: row.get::<_, i64>(6)? as u64,
            })
        };
        let mut result = Vec::new();
        if let Some(n) = limit {
            let rows = stmt.query_map(params![conversation_id, n as i64], map_row)?;
            for row in rows {
                result.push(row?);
            }
        } else {
            let rows = stmt.query_map(params![conversation_id], map_row)?;
            for row in rows {
                result.push(row?);
            }
        }
        Ok(result)
    }

    pub fn update_message_status(
        &self,
        message_id: &str,
        status: &str,
    ) -> Result<bool, StorageError> {
        let affected = self.conn.execute(
            "UPDATE messages SET status = ?1 WHERE message_id = ?2",
            params![status, message_id],
        )?;
        Ok(affected > 0)
    }

    /// Newest cached message timestamp for a conversation, if any.
    pub fn newest_message_timestamp(
        &self,
        conversation_id: &str,
    ) -> Result<Option<u64>, StorageError> {
        let value = self.conn.query_row(
            "SELECT MAX(timestamp) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(value.map(|v| v as u64))
    }

    pub fn delete_message(&self, message_id: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM messages WHERE message_id = ?1", params![message_id])?;
        Ok(affected > 0)
    }

    // -----------------------------------------------------------------------
    // Outgoing queue
    // -----------------------------------------------------------------------

    pub fn enqueue_outbox(&self, row: &OutboxRow) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO outbox (local_id, conversation_id, content, queued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                row.local_id,
                row.conversation_id,
                row.content,
                row.queued_at as i64,
            ],
        )?;
        Ok(())
    }

    /// List queued entries in FIFO order.
    pub fn list_outbox(&self) -> Result<Vec<OutboxRow>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT local_id, conversation_id, content, queued_at
             FROM outbox ORDER BY queued_at, rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OutboxRow {
                local_id: row.get(0)?,
                conversation_id: row.get(1)?,
                content: row.get(2)?,
                queued_at: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn remove_outbox(&self, local_id: &str) -> Result<bool, StorageError> {
        let affected = self
            .conn
            .execute("DELETE FROM outbox WHERE local_id = ?1", params![local_id])?;
        Ok(affected > 0)
    }

    pub fn outbox_len(&self) -> Result<u32, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))?;
        Ok(count as u32)
    }

    // -----------------------------------------------------------------------
    // Settings and sync state
    // -----------------------------------------------------------------------

    /// Load cache settings, falling back to defaults for missing keys.
    pub fn load_settings(&self) -> Result<CacheSettings, StorageError> {
        let mut settings = CacheSettings::default();
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (key, value) = row?;
            match key.as_str() {
                "max_conversations" => {
                    if let Ok(v) = value.parse() {
                        settings.max_conversations = v;
                    }
                }
                "max_messages_per_conversation" => {
                    if let Ok(v) = value.parse() {
                        settings.max_messages_per_conversation = v;
                    }
                }
                "retention_days" => {
                    if let Ok(v) = value.parse() {
                        settings.retention_days = v;
                    }
                }
                "sync_interval_secs" => {
                    if let Ok(v) = value.parse() {
                        settings.sync_interval_secs = v;
                    }
                }
                _ => {}
            }
        }
        Ok(settings)
    }

    pub fn store_settings(&self, settings: &CacheSettings) -> Result<(), StorageError> {
        self.set_setting("max_conversations", &settings.max_conversations.to_string())?;
        self.set_setting(
            "max_messages_per_conversation",
            &settings.max_messages_per_conversation.to_string(),
        )?;
        self.set_setting("retention_days", &settings.retention_days.to_string())?;
        self.set_setting(
            "sync_interval_secs",
            &settings.sync_interval_secs.to_string(),
        )?;
        Ok(())
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Last successful sync time for the given scope (e.g. `conversations`
    /// or `messages:<conversation_id>`).
    pub fn last_sync(&self, scope: &str) -> Result<Option<u64>, StorageError> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![scope],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    pub fn set_last_sync(&self, scope: &str, when: u64) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
            params![scope, when as i64],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bounds enforcement
    // -----------------------------------------------------------------------

    /// Enforce cache bounds: oldest conversations beyond `max_conversations`
    /// are dropped together with their messages, each conversation keeps at
    /// most `max_messages_per_conversation` newest messages, and messages
    /// older than `retention_days` are deleted.  The outbox is never pruned.
    pub fn enforce_bounds(
        &self,
        settings: &CacheSettings,
        now: u64,
    ) -> Result<PruneReport, StorageError> {
        let mut report = PruneReport::default();

        // Excess conversations, oldest activity first.
        let excess: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT conversation_id FROM conversations
                 ORDER BY last_message_time DESC, conversation_id
                 LIMIT -1 OFFSET ?1",
            )?;
            let rows = stmt.query_map(params![settings.max_conversations as i64], |row| {
                row.get::<_, String>(0)
            })?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        for conversation_id in &excess {
            let msgs = self.conn.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            self.conn.execute(
                "DELETE FROM conversations WHERE conversation_id = ?1",
                params![conversation_id],
            )?;
            report.conversations_pruned += 1;
            report.messages_pruned += msgs;
        }

        // Per-conversation truncation, oldest messages first.
        let conversation_ids: Vec<String> = {
            let mut stmt = self
                .conn
                .prepare("SELECT conversation_id FROM conversations")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };
        for conversation_id in &conversation_ids {
            let pruned = self.conn.execute(
                "DELETE FROM messages WHERE message_id IN (
                     SELECT message_id FROM messages WHERE conversation_id = ?1
                     ORDER BY timestamp DESC, message_id
                     LIMIT -1 OFFSET ?2)",
                params![
                    conversation_id,
                    settings.max_messages_per_conversation as i64
                ],
            )?;
            report.messages_pruned += pruned;
        }

        // Retention window.
        if settings.retention_days > 0 {
            let cutoff = now.saturating_sub(settings.retention_days as u64 * 86_400);
            let pruned = self.conn.execute(
                "DELETE FROM messages WHERE timestamp < ?1",
                params![cutoff as i64],
            )?;
            report.messages_pruned += pruned;
        }

        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resolve the database path: `{data_dir}/chatsync.db`.
pub fn db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("chatsync.db")
}

/// Resolve the data directory from environment or default.
pub fn resolve_data_dir() -> PathBuf {
    std::env::var("CHATSYNC_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".chatsync"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn conversation(id: &str, last_time: u64, unread: u32) -> ConversationRow {
        ConversationRow {
            conversation_id: id.to_string(),
            contact_name: Some(format!("Contact {id}")),
            phone: None,
            last_message_time: last_time,
            last_message: Some("hi".to_string()),
            unread_count: unread,
            updated_at: now_secs(),
        }
    }

    fn message(id: &str, conversation_id: &str, ts: u64) -> MessageRow {
        MessageRow {
            message_id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: "contact".to_string(),
            content: format!("message {id}"),
            timestamp: ts,
            status: "delivered".to_string(),
            received_at: now_secs(),
        }
    }

    #[test]
    fn test_conversation_crud() {
        let storage = test_storage();

        storage.upsert_conversation(&conversation("conv-1", 100, 2)).unwrap();
        let loaded = storage.get_conversation("conv-1").unwrap().unwrap();
        assert_eq!(loaded.unread_count, 2);
        assert_eq!(loaded.last_message_time, 100);

        // Upsert replaces
        storage.upsert_conversation(&conversation("conv-1", 200, 0)).unwrap();
        let loaded = storage.get_conversation("conv-1").unwrap().unwrap();
        assert_eq!(loaded.last_message_time, 200);

        storage.upsert_conversation(&conversation("conv-2", 300, 1)).unwrap();
        let all = storage.list_conversations().unwrap();
        assert_eq!(all.len(), 2);
        // Newest activity first
        assert_eq!(all[0].conversation_id, "conv-2");

        assert!(storage.delete_conversation("conv-1").unwrap());
        assert!(storage.get_conversation("conv-1").unwrap().is_none());
        assert!(!storage.delete_conversation("conv-1").unwrap());
    }

    #[test]
    fn test_message_crud() {
        let storage = test_storage();

        storage.insert_message(&message("m-1", "conv-1", 10)).unwrap();
        storage.insert_message(&message("m-2", "conv-1", 20)).unwrap();
        storage.insert_message(&message("m-3", "conv-2", 30)).unwrap();

        assert!(storage.has_message("m-1").unwrap());
        assert!(!storage.has_message("m-404").unwrap());

        let loaded = storage.get_message("m-2").unwrap().unwrap();
        assert_eq!(loaded.timestamp, 20);
        assert_eq!(loaded.status, "delivered");

        let msgs = storage.list_conversation_messages("conv-1", None).unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message_id, "m-1"); // ascending

        assert!(storage.update_message_status("m-1", "read").unwrap());
        assert_eq!(storage.get_message("m-1").unwrap().unwrap().status, "read");

        assert!(storage.delete_message("m-3").unwrap());
        assert!(!storage.has_message("m-3").unwrap());
    }

    #[test]
    fn test_duplicate_message_ignored() {
        let storage = test_storage();
        storage.insert_message(&message("m-dup", "conv-1", 10)).unwrap();

        let second = MessageRow {
            content: "other content".to_string(),
            ..message("m-dup", "conv-1", 99)
        };
        storage.insert_message(&second).unwrap();

        // Original row wins (INSERT OR IGNORE)
        let loaded = storage.get_message("m-dup").unwrap().unwrap();
        assert_eq!(loaded.timestamp, 10);
    }

    #[test]
    fn test_message_list_limit_keeps_newest() {
        let storage = test_storage();
        for i in 0..5 {
            storage.insert_message(&message(&format!("m-{i}"), "conv-1", i)).unwrap();
        }
        let limited = storage.list_conversation_messages("conv-1", Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        // Newest two, ascending
        assert_eq!(limited[0].message_id, "m-3");
        assert_eq!(limited[1].message_id, "m-4");
    }

    #[test]
    fn test_newest_message_timestamp() {
        let storage = test_storage();
        assert!(storage.newest_message_timestamp("conv-1").unwrap().is_none());

        storage.insert_message(&message("m-1", "conv-1", 10)).unwrap();
        storage.insert_message(&message("m-2", "conv-1", 30)).unwrap();
        storage.insert_message(&message("m-3", "conv-2", 99)).unwrap();

        assert_eq!(storage.newest_message_timestamp("conv-1").unwrap(), Some(30));
    }

    #[test]
    fn test_mark_conversation_read() {
        let storage = test_storage();
        storage.upsert_conversation(&conversation("conv-1", 100, 3)).unwrap();
        storage.insert_message(&message("m-1", "conv-1", 10)).unwrap();

        assert!(storage.mark_conversation_read("conv-1").unwrap());
        let conv = storage.get_conversation("conv-1").unwrap().unwrap();
        assert_eq!(conv.unread_count, 0);
        assert_eq!(storage.get_message("m-1").unwrap().unwrap().status, "read");
    }

    #[test]
    fn test_touch_conversation() {
        let storage = test_storage();

        // Creates a minimal row when missing
        storage.touch_conversation("conv-new", 50, "hello").unwrap();
        let conv = storage.get_conversation("conv-new").unwrap().unwrap();
        assert_eq!(conv.last_message_time, 50);
        assert_eq!(conv.last_message, Some("hello".to_string()));

        // Older timestamp does not regress the preview
        storage.touch_conversation("conv-new", 40, "stale").unwrap();
        let conv = storage.get_conversation("conv-new").unwrap().unwrap();
        assert_eq!(conv.last_message_time, 50);
        assert_eq!(conv.last_message, Some("hello".to_string()));
    }

    #[test]
    fn test_outbox_fifo() {
        let storage = test_storage();
        for i in 0..3 {
            storage
                .enqueue_outbox(&OutboxRow {
                    local_id: format!("q-{i}"),
                    conversation_id: "conv-1".to_string(),
                    content: format!("queued {i}"),
                    queued_at: 100 + i,
                })
                .unwrap();
        }
        assert_eq!(storage.outbox_len().unwrap(), 3);

        let queue = storage.list_outbox().unwrap();
        assert_eq!(queue[0].local_id, "q-0");
        assert_eq!(queue[2].local_id, "q-2");

        assert!(storage.remove_outbox("q-0").unwrap());
        assert_eq!(storage.outbox_len().unwrap(), 2);
        assert_eq!(storage.list_outbox().unwrap()[0].local_id, "q-1");
    }

    #[test]
    fn test_settings_roundtrip() {
        let storage = test_storage();

        // Defaults when nothing stored
        let settings = storage.load_settings().unwrap();
        assert_eq!(settings, CacheSettings::default());

        let custom = CacheSettings {
            max_conversations: 10,
            max_messages_per_conversation: 25,
            retention_days: 7,
            sync_interval_secs: 60,
        };
        storage.store_settings(&custom).unwrap();
        assert_eq!(storage.load_settings().unwrap(), custom);

        // Unparseable value falls back to the default
        storage.set_setting("retention_days", "banana").unwrap();
        assert_eq!(storage.load_settings().unwrap().retention_days, 30);
    }

    #[test]
    fn test_last_sync_scopes() {
        let storage = test_storage();
        assert!(storage.last_sync("conversations").unwrap().is_none());

        storage.set_last_sync("conversations", 1_000).unwrap();
        storage.set_last_sync("messages:conv-1", 2_000).unwrap();

        assert_eq!(storage.last_sync("conversations").unwrap(), Some(1_000));
        assert_eq!(storage.last_sync("messages:conv-1").unwrap(), Some(2_000));

        storage.set_last_sync("conversations", 3_000).unwrap();
        assert_eq!(storage.last_sync("conversations").unwrap(), Some(3_000));
    }

    #[test]
    fn test_enforce_bounds_max_conversations() {
        let storage = test_storage();
        let settings = CacheSettings {
            max_conversations: 2,
            ..CacheSettings::default()
        };
        let now = now_secs();

        for i in 0..4u64 {
            storage
                .upsert_conversation(&conversation(&format!("conv-{i}"), now + i, 0))
                .unwrap();
            storage
                .insert_message(&message(&format!("m-{i}"), &format!("conv-{i}"), now + i))
                .unwrap();
        }

        let report = storage.enforce_bounds(&settings, now).unwrap();
        assert_eq!(report.conversations_pruned, 2);
        assert_eq!(report.messages_pruned, 2);

        // Newest two survive
        let remaining = storage.list_conversations().unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].conversation_id, "conv-3");
        assert_eq!(remaining[1].conversation_id, "conv-2");
        assert!(!storage.has_message("m-0").unwrap());
        assert!(storage.has_message("m-3").unwrap());
    }

    #[test]
    fn test_enforce_bounds_max_messages() {
        let storage = test_storage();
        let settings = CacheSettings {
            max_messages_per_conversation: 3,
            retention_days: 0,
            ..CacheSettings::default()
        };
        let now = now_secs();

        storage.upsert_conversation(&conversation("conv-1", now, 0)).unwrap();
        for i in 0..5u64 {
            storage.insert_message(&message(&format!("m-{i}"), "conv-1", now + i)).unwrap();
        }

        let report = storage.enforce_bounds(&settings, now).unwrap();
        assert_eq!(report.messages_pruned, 2);

        let msgs = storage.list_conversation_messages("conv-1", None).unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].message_id, "m-2"); // oldest two dropped
    }

    #[test]
    fn test_enforce_bounds_retention() {
        let storage = test_storage();
        let settings = CacheSettings {
            retention_days: 1,
            ..CacheSettings::default()
        };
        let now = now_secs();

        storage.upsert_conversation(&conversation("conv-1", now, 0)).unwrap();
        storage.insert_message(&message("m-old", "conv-1", now - 2 * 86_400)).unwrap();
        storage.insert_message(&message("m-new", "conv-1", now)).unwrap();

        let report = storage.enforce_bounds(&settings, now).unwrap();
        assert_eq!(report.messages_pruned, 1);
        assert!(!storage.has_message("m-old").unwrap());
        assert!(storage.has_message("m-new").unwrap());
    }

    #[test]
    fn test_enforce_bounds_spares_outbox() {
        let storage = test_storage();
        let settings = CacheSettings {
            max_conversations: 0,
            retention_days: 1,
            ..CacheSettings::default()
        };
        let now = now_secs();

        storage.upsert_conversation(&conversation("conv-1", now, 0)).unwrap();
        storage
            .enqueue_outbox(&OutboxRow {
                local_id: "q-1".to_string(),
                conversation_id: "conv-1".to_string(),
                content: "still queued".to_string(),
                queued_at: now - 10 * 86_400,
            })
            .unwrap();

        storage.enforce_bounds(&settings, now).unwrap();
        assert!(storage.list_conversations().unwrap().is_empty());
        assert_eq!(storage.outbox_len().unwrap(), 1);
    }
}
