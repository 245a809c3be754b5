//! Pure merge logic for reconciling server and local state.
//!
//! A message is considered a duplicate of another if their ids match OR if
//! both timestamp and content match (the backend may re-assign ids to
//! messages the client created while offline).  Conversations merge by id,
//! taking the larger unread count and the newer activity timestamp; metadata
//! is last-write-wins in the server's favour.  Both merges are unions: local
//! entries the server no longer reports are preserved.

use std::collections::HashMap;

use crate::storage::{ConversationRow, MessageRow};

/// Whether `a` and `b` refer to the same message.
pub fn is_duplicate_message(a: &MessageRow, b: &MessageRow) -> bool {
    a.message_id == b.message_id || (a.timestamp == b.timestamp && a.content == b.content)
}

/// Position of a status in the delivery progression.  Unknown statuses rank
/// lowest so they never displace a known one.
fn status_rank(status: &str) -> u8 {
    match status {
        "sent" => 1,
        "delivered" => 2,
        "read" => 3,
        _ => 0,
    }
}

/// Result of merging server messages into the local list.
#[derive(Debug, Default)]
pub struct MessageMergeOutcome {
    /// Full merged list, ascending by `(timestamp, id)`.
    pub merged: Vec<MessageRow>,
    /// Server messages that were new to the local cache.
    pub added: Vec<MessageRow>,
    /// Local messages whose status was updated from the server copy.
    pub updated: Vec<MessageRow>,
}

/// Union-merge `remote` messages into `local`.
///
/// Local entries are always preserved.  A remote message that duplicates a
/// local one by id may still carry a newer delivery status, which is
/// adopted; status only ever moves forward (sent, delivered, read), so a
/// server lagging behind a local mark-read cannot regress it.  A duplicate
/// by timestamp+content (differing id) leaves the local entry untouched.
/// Novel remote messages are appended.
pub fn merge_messages(local: Vec<MessageRow>, remote: Vec<MessageRow>) -> MessageMergeOutcome {
    let mut merged = local;
    let mut added = Vec::new();
    let mut updated = Vec::new();

    for remote_msg in remote {
        let mut duplicate = false;
        for local_msg in merged.iter_mut() {
            if local_msg.message_id == remote_msg.message_id {
                duplicate = true;
                if status_rank(&remote_msg.status) > status_rank(&local_msg.status) {
                    local_msg.status = remote_msg.status.clone();
                    updated.push(local_msg.clone());
                }
                break;
            }
            if local_msg.timestamp == remote_msg.timestamp
                && local_msg.content == remote_msg.content
            {
                duplicate = true;
                break;
            }
        }
        if !duplicate {
            added.push(remote_msg.clone());
            merged.push(remote_msg);
        }
    }

    merged.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });

    MessageMergeOutcome {
        merged,
        added,
        updated,
    }
}

/// Result of merging server conversations into the local list.
#[derive(Debug, Default)]
pub struct ConversationMergeOutcome {
    /// Full merged list, newest activity first.
    pub merged: Vec<ConversationRow>,
    /// Conversations that were added or materially changed by the server.
    pub changed: Vec<ConversationRow>,
}

/// Union-merge `remote` conversations into `local`, keyed by id.
///
/// For a conversation present on both sides: `unread_count` takes the max,
/// `last_message_time` takes the max, and name/phone/preview follow the
/// server when it supplies a value.  Local-only conversations are kept.
pub fn merge_conversations(
    local: Vec<ConversationRow>,
    remote: Vec<ConversationRow>,
) -> ConversationMergeOutcome {
    let mut by_id: HashMap<String, ConversationRow> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for conv in local {
        order.push(conv.conversation_id.clone());
        by_id.insert(conv.conversation_id.clone(), conv);
    }

    let mut changed = Vec::new();
    for remote_conv in remote {
        match by_id.get_mut(&remote_conv.conversation_id) {
            Some(local_conv) => {
                let before = local_conv.clone();
                local_conv.unread_count = local_conv.unread_count.max(remote_conv.unread_count);
                if remote_conv.last_message_time >= local_conv.last_message_time {
                    local_conv.last_message_time = remote_conv.last_message_time;
                    if remote_conv.last_message.is_some() {
                        local_conv.last_message = remote_conv.last_message.clone();
                    }
                }
                if remote_conv.contact_name.is_some() {
                    local_conv.contact_name = remote_conv.contact_name.clone();
                }
                if remote_conv.phone.is_some() {
                    local_conv.phone = remote_conv.phone.clone();
                }
                local_conv.updated_at = local_conv.updated_at.max(remote_conv.updated_at);
                if local_conv.unread_count != before.unread_count
                    || local_conv.last_message_time != before.last_message_time
                    || local_conv.last_message != before.last_message
                    || local_conv.contact_name != before.contact_name
                    || local_conv.phone != before.phone
                {
                    changed.push(local_conv.clone());
                }
            }
            None => {
                order.push(remote_conv.conversation_id.clone());
                changed.push(remote_conv.clone());
                by_id.insert(remote_conv.conversation_id.clone(), remote_conv);
            }
        }
    }

    let mut merged: Vec<ConversationRow> = order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect();
    merged.sort_by(|a, b| {
        b.last_message_time
            .cmp(&a.last_message_time)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });

    ConversationMergeOutcome { merged, changed }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
