//! Sync client: fetch-merge-persist cycles and the offline outgoing queue.
//!
//! `SyncClient` is the single entry point applications use.  Reads are
//! cache-first: callers always get the local cache back, and a network
//! refresh happens opportunistically when the client is online and the sync
//! interval has elapsed.  Network failures during a refresh are logged and
//! swallowed so a read never fails because of connectivity.
//!
//! Sends go straight to the backend while online.  While offline they are
//! persisted with status `queued` and appended to a FIFO outbox, which is
//! replayed sequentially when the client comes back online.  A replayed or
//! direct send that fails leaves the message behind with status `failed`;
//! there is no automatic retry or backoff.
//!
//! All mutation happens through `&mut SyncClient` on the caller's thread;
//! there is no internal locking.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::api::{self, ApiError, RemoteConversation, RemoteMessage, SendRequest};
use crate::clog;
use crate::merge::{merge_conversations, merge_messages};
use crate::storage::{
    now_secs, ConversationRow, MessageRow, OutboxRow, Storage, StorageError,
};
use crate::logging;

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

/// Lookback subtracted from the newest cached message timestamp when asking
/// the backend for recent messages.  Messages can reach the server well
/// after their send timestamp (sender offline, clock skew), so the fetch
/// window reaches back a day; the merge dedupes the overlap.
pub const LATE_ARRIVAL_GRACE_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    api_url: String,
    agent_id: String,
}

impl SyncConfig {
    pub fn new(api_url: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            agent_id: agent_id.into(),
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Identity recorded as the sender of outgoing messages.
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

#[derive(Debug)]
pub enum SyncError {
    Storage(StorageError),
    Api(ApiError),
    Offline,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Storage(e) => write!(f, "storage error: {e}"),
            SyncError::Api(e) => write!(f, "api error: {e}"),
            SyncError::Offline => write!(f, "client is offline"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StorageError> for SyncError {
    fn from(e: StorageError) -> Self {
        SyncError::Storage(e)
    }
}

impl From<ApiError> for SyncError {
    fn from(e: ApiError) -> Self {
        SyncError::Api(e)
    }
}

// ---------------------------------------------------------------------------
// Handler and outcome types
// ---------------------------------------------------------------------------

/// Push-style callbacks invoked during sync and queue processing.  All
/// methods default to no-ops so implementors override only what they need.
pub trait SyncHandler {
    /// A message new to the local cache was stored.
    fn on_message(&mut self, _message: &MessageRow) {}
    /// A conversation was added or materially changed by a server merge.
    fn on_conversation(&mut self, _conversation: &ConversationRow) {}
    /// A direct or replayed send failed; the message is stored with status
    /// `failed`.
    fn on_send_failed(&mut self, _message: &MessageRow, _reason: &str) {}
    /// The outgoing queue finished a replay pass.
    fn on_queue_flushed(&mut self, _outcome: &FlushOutcome) {}
}

/// Result of a [`SyncClient::send`] call.
#[derive(Debug, Clone)]
pub enum SendOutcome {
    /// The backend confirmed the message; the stored row carries the
    /// server-assigned id.
    Sent(MessageRow),
    /// The client is offline; the message is queued for replay.
    Queued(MessageRow),
    /// The backend rejected or never received the message; stored with
    /// status `failed` and not retried.
    Failed(MessageRow),
}

/// Counts from one outgoing-queue replay pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlushOutcome {
    pub sent: usize,
    pub failed: usize,
}

/// Counts from a full [`SyncClient::sync_now`] cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncReport {
    pub conversations_fetched: usize,
    pub conversations_failed: usize,
    pub messages_added: usize,
}

// ---------------------------------------------------------------------------
// SyncClient
// ---------------------------------------------------------------------------

pub struct SyncClient {
    storage: Storage,
    config: SyncConfig,
    online: bool,
    handler: Option<Box<dyn SyncHandler>>,
}

impl SyncClient {
    pub fn new(storage: Storage, config: SyncConfig) -> Self {
        Self {
            storage,
            config,
            online: true,
            handler: None,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register a handler for push-style callbacks.
    pub fn set_handler(&mut self, handler: Box<dyn SyncHandler>) {
        self.handler = Some(handler);
    }

    pub fn clear_handler(&mut self) {
        self.handler = None;
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Flip connectivity.  The offline-to-online transition replays the
    /// outgoing queue and then forces a sync; errors on that path are logged
    /// and swallowed, matching the read path's silent-fallback discipline.
    pub fn set_online(&mut self, online: bool) {
        let was_online = self.online;
        self.online = online;
        if online && !was_online {
            clog!("sync: back online, replaying outgoing queue");
            match self.flush_outbox() {
                Ok(outcome) if outcome.sent + outcome.failed > 0 => {
                    clog!(
                        "sync: queue replay done ({} sent, {} failed)",
                        outcome.sent,
                        outcome.failed
                    );
                }
                Ok(_) => {}
                Err(e) => clog!("sync: queue replay error: {e}"),
            }
            if let Err(e) = self.sync_now() {
                clog!("sync: resync after reconnect failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads (cache-first)
    // -----------------------------------------------------------------------

    /// List conversations from the cache, refreshing from the backend first
    /// when online and the sync interval has elapsed.  Refresh failures fall
    /// back silently to cached data.
    pub fn conversations(&mut self) -> Result<Vec<ConversationRow>, SyncError> {
        if self.refresh_due("conversations")? {
            if let Err(e) = self.sync_conversations() {
                clog!("sync: conversation refresh failed, serving cache: {e}");
            }
        }
        Ok(self.storage.list_conversations()?)
    }

    /// List a conversation's messages from the cache, same refresh
    /// discipline as [`conversations`](Self::conversations).
    pub fn messages(&mut self, conversation_id: &str) -> Result<Vec<MessageRow>, SyncError> {
        let scope = format!("messages:{conversation_id}");
        if self.refresh_due(&scope)? {
            if let Err(e) = self.sync_messages_for(conversation_id) {
                clog!(
                    "sync: message refresh for {} failed, serving cache: {e}",
                    logging::conv_id(conversation_id)
                );
            }
        }
        Ok(self
            .storage
            .list_conversation_messages(conversation_id, None)?)
    }

    fn refresh_due(&self, scope: &str) -> Result<bool, SyncError> {
        if !self.online {
            return Ok(false);
        }
        let settings = self.storage.load_settings()?;
        let last = self.storage.last_sync(scope)?.unwrap_or(0);
        Ok(now_secs().saturating_sub(last) >= settings.sync_interval_secs)
    }

    // -----------------------------------------------------------------------
    // Sync cycles
    // -----------------------------------------------------------------------

    /// Unconditional fetch-merge-persist of the conversation list and every
    /// cached conversation's messages.  Per-conversation failures are logged
    /// and skipped; a conversation-list failure aborts the cycle.
    pub fn sync_now(&mut self) -> Result<SyncReport, SyncError> {
        if !self.online {
            return Err(SyncError::Offline);
        }
        let mut report = SyncReport::default();

        let merged = self.sync_conversations()?;
        report.conversations_fetched = merged;

        for conv in self.storage.list_conversations()? {
            match self.sync_messages_for(&conv.conversation_id) {
                Ok(added) => report.messages_added += added,
                Err(e) => {
                    report.conversations_failed += 1;
                    clog!(
                        "sync: messages for {} failed: {e}",
                        logging::conv_id(&conv.conversation_id)
                    );
                }
            }
        }

        clog!(
            "sync: cycle done ({} conversation(s), {} new message(s), {} failed)",
            report.conversations_fetched,
            report.messages_added,
            report.conversations_failed
        );
        Ok(report)
    }

    /// Fetch and merge the conversation list.  Returns the merged count.
    fn sync_conversations(&mut self) -> Result<usize, SyncError> {
        let remote = api::fetch_conversations(self.config.api_url())?;
        let now = now_secs();
        let remote_rows: Vec<ConversationRow> =
            remote.into_iter().map(|c| remote_conversation_to_row(c, now)).collect();

        let local = self.storage.list_conversations()?;
        let outcome = merge_conversations(local, remote_rows);

        for conv in &outcome.merged {
            self.storage.upsert_conversation(conv)?;
        }
        let settings = self.storage.load_settings()?;
        let pruned = self.storage.enforce_bounds(&settings, now)?;
        if !pruned.is_empty() {
            clog!(
                "sync: pruned {} conversation(s), {} message(s)",
                pruned.conversations_pruned,
                pruned.messages_pruned
            );
        }
        self.storage.set_last_sync("conversations", now)?;

        for conv in &outcome.changed {
            if let Some(handler) = self.handler.as_mut() {
                handler.on_conversation(conv);
            }
        }
        Ok(outcome.merged.len())
    }

    /// Fetch and merge one conversation's messages.  Returns the number of
    /// newly added messages.
    ///
    /// The `since` filter is a domain-time cursor derived from the newest
    /// cached message, pulled back by [`LATE_ARRIVAL_GRACE_SECS`] so
    /// messages the server received late are still picked up.
    fn sync_messages_for(&mut self, conversation_id: &str) -> Result<usize, SyncError> {
        let scope = format!("messages:{conversation_id}");
        let since = self
            .storage
            .newest_message_timestamp(conversation_id)?
            .map(|ts| ts.saturating_sub(LATE_ARRIVAL_GRACE_SECS));
        let remote = api::fetch_messages(self.config.api_url(), conversation_id, since)?;
        let now = now_secs();
        let remote_rows: Vec<MessageRow> = remote
            .into_iter()
            .map(|m| remote_message_to_row(m, conversation_id, now))
            .collect();

        let local = self
            .storage
            .list_conversation_messages(conversation_id, None)?;
        let outcome = merge_messages(local, remote_rows);

        for msg in &outcome.added {
            self.storage.insert_message(msg)?;
        }
        for msg in &outcome.updated {
            self.storage
                .update_message_status(&msg.message_id, &msg.status)?;
        }
        let settings = self.storage.load_settings()?;
        self.storage.enforce_bounds(&settings, now)?;
        self.storage.set_last_sync(&scope, now)?;

        for msg in &outcome.added {
            clog!(
                "sync: new message {} in {}",
                logging::msg_id(&msg.message_id),
                logging::conv_id(conversation_id)
            );
            if let Some(handler) = self.handler.as_mut() {
                handler.on_message(msg);
            }
        }
        Ok(outcome.added.len())
    }

    // -----------------------------------------------------------------------
    // Sends and the outgoing queue
    // -----------------------------------------------------------------------

    /// Send a message.  While online the backend is called immediately and a
    /// failure is final (`Failed`, no retry); while offline the message is
    /// queued for replay on reconnect.
    pub fn send(
        &mut self,
        conversation_id: &str,
        content: &str,
    ) -> Result<SendOutcome, SyncError> {
        let now = now_secs();
        let local_id = local_message_id(conversation_id, now, content);

        if !self.online {
            let row = MessageRow {
                message_id: local_id.clone(),
                conversation_id: conversation_id.to_string(),
                sender: self.config.agent_id().to_string(),
                content: content.to_string(),
                timestamp: now,
                status: "queued".to_string(),
                received_at: now,
            };
            self.storage.insert_message(&row)?;
            self.storage.enqueue_outbox(&OutboxRow {
                local_id,
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
                queued_at: now,
            })?;
            self.storage
                .touch_conversation(conversation_id, now, content)?;
            clog!(
                "send: offline, queued {} for {}",
                logging::msg_id(&row.message_id),
                logging::conv_id(conversation_id)
            );
            return Ok(SendOutcome::Queued(row));
        }

        match self.post_send(conversation_id, content, &local_id, now) {
            Ok(row) => Ok(SendOutcome::Sent(row)),
            Err(e) => {
                let row = MessageRow {
                    message_id: local_id,
                    conversation_id: conversation_id.to_string(),
                    sender: self.config.agent_id().to_string(),
                    content: content.to_string(),
                    timestamp: now,
                    status: "failed".to_string(),
                    received_at: now,
                };
                self.storage.insert_message(&row)?;
                self.storage
                    .touch_conversation(conversation_id, now, content)?;
                let reason = e.to_string();
                clog!(
                    "send: failed for {}: {reason}",
                    logging::conv_id(conversation_id)
                );
                if let Some(handler) = self.handler.as_mut() {
                    handler.on_send_failed(&row, &reason);
                }
                Ok(SendOutcome::Failed(row))
            }
        }
    }

    /// Replay the outgoing queue sequentially.  Every entry leaves the queue:
    /// successes become `sent` messages under the server-assigned id,
    /// failures leave the queued message behind as `failed`.  No-op while
    /// offline.
    pub fn flush_outbox(&mut self) -> Result<FlushOutcome, SyncError> {
        let mut outcome = FlushOutcome::default();
        if !self.online {
            return Ok(outcome);
        }

        for entry in self.storage.list_outbox()? {
            match self.post_send(
                &entry.conversation_id,
                &entry.content,
                &entry.local_id,
                entry.queued_at,
            ) {
                Ok(row) => {
                    // The queued placeholder is superseded by the confirmed
                    // row, unless the backend echoed the client id back.
                    if row.message_id != entry.local_id {
                        self.storage.delete_message(&entry.local_id)?;
                    }
                    self.storage
                        .update_message_status(&row.message_id, &row.status)?;
                    outcome.sent += 1;
                }
                Err(e) => {
                    self.storage
                        .update_message_status(&entry.local_id, "failed")?;
                    let row = match self.storage.get_message(&entry.local_id)? {
                        Some(row) => row,
                        None => {
                            // The placeholder was pruned while the entry
                            // waited in the queue; restore it so the failure
                            // stays visible.
                            let row = MessageRow {
                                message_id: entry.local_id.clone(),
                                conversation_id: entry.conversation_id.clone(),
                                sender: self.config.agent_id().to_string(),
                                content: entry.content.clone(),
                                timestamp: entry.queued_at,
                                status: "failed".to_string(),
                                received_at: now_secs(),
                            };
                            self.storage.insert_message(&row)?;
                            row
                        }
                    };
                    outcome.failed += 1;
                    let reason = e.to_string();
                    clog!(
                        "flush: send {} failed: {reason}",
                        logging::msg_id(&entry.local_id)
                    );
                    if let Some(handler) = self.handler.as_mut() {
                        handler.on_send_failed(&row, &reason);
                    }
                }
            }
            self.storage.remove_outbox(&entry.local_id)?;
        }

        if let Some(handler) = self.handler.as_mut() {
            handler.on_queue_flushed(&outcome);
        }
        Ok(outcome)
    }

    /// POST one message and persist the server-confirmed row.
    fn post_send(
        &mut self,
        conversation_id: &str,
        content: &str,
        client_ref: &str,
        timestamp: u64,
    ) -> Result<MessageRow, SyncError> {
        let request = SendRequest {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            sender: self.config.agent_id().to_string(),
            client_ref: client_ref.to_string(),
        };
        let confirmed = api::send_message(self.config.api_url(), &request)?;
        let now = now_secs();
        let mut row = remote_message_to_row(confirmed, conversation_id, now);
        if row.sender.is_empty() {
            row.sender = self.config.agent_id().to_string();
        }
        if row.content.is_empty() {
            row.content = content.to_string();
        }
        if row.timestamp == 0 {
            row.timestamp = timestamp;
        }
        self.storage.insert_message(&row)?;
        self.storage
            .touch_conversation(conversation_id, row.timestamp, &row.content)?;
        clog!(
            "send: confirmed {} for {}",
            logging::msg_id(&row.message_id),
            logging::conv_id(conversation_id)
        );
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// Conversions and ids
// ---------------------------------------------------------------------------

fn remote_conversation_to_row(remote: RemoteConversation, now: u64) -> ConversationRow {
    ConversationRow {
        conversation_id: remote.id,
        contact_name: remote.contact_name,
        phone: remote.phone,
        last_message_time: remote.last_message_time,
        last_message: remote.last_message,
        unread_count: remote.unread_count,
        updated_at: now,
    }
}

fn remote_message_to_row(
    remote: RemoteMessage,
    conversation_id: &str,
    now: u64,
) -> MessageRow {
    let conversation_id = if remote.conversation_id.is_empty() {
        conversation_id.to_string()
    } else {
        remote.conversation_id
    };
    MessageRow {
        message_id: remote.id,
        conversation_id,
        sender: remote.sender,
        content: remote.content,
        timestamp: remote.timestamp,
        status: remote.status,
        received_at: now,
    }
}

/// Client-side message id: salted SHA-256 over the conversation id, the
/// queue timestamp, and the content, base64url-encoded.  The salt keeps two
/// identical sends in the same second from colliding.
fn local_message_id(conversation_id: &str, queued_at: u64, content: &str) -> String {
    let mut salt = [0u8; 8];
    OsRng.fill_bytes(&mut salt);
    let mut bytes = Vec::with_capacity(conversation_id.len() + content.len() + 16);
    bytes.extend_from_slice(conversation_id.as_bytes());
    bytes.extend_from_slice(&queued_at.to_be_bytes());
    bytes.extend_from_slice(content.as_bytes());
    bytes.extend_from_slice(&salt);
    let digest = Sha256::digest(&bytes);
    URL_SAFE_NO_PAD.encode(digest)
}
