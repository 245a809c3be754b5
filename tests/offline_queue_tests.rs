//! Offline behaviour: queueing sends, replaying the queue, and the
//! cache-first read discipline when the backend is unreachable.
//!
//! These tests use an address nothing listens on, so every network attempt
//! fails fast with a connection error.

use std::sync::{Arc, Mutex};

use chatsync::storage::{ConversationRow, MessageRow, Storage};
use chatsync::sync::{FlushOutcome, SendOutcome, SyncClient, SyncConfig, SyncHandler};

/// No listener on port 1; connections are refused immediately.
const DEAD_URL: &str = "http://127.0.0.1:1";

fn test_client() -> SyncClient {
    let storage = Storage::open_in_memory().expect("in-memory storage");
    SyncClient::new(storage, SyncConfig::new(DEAD_URL, "agent-1"))
}

fn seed_conversation(client: &SyncClient, id: &str, last_time: u64, unread: u32) {
    client
        .storage()
        .upsert_conversation(&ConversationRow {
            conversation_id: id.to_string(),
            contact_name: Some("Seeded".to_string()),
            phone: None,
            last_message_time: last_time,
            last_message: Some("seeded".to_string()),
            unread_count: unread,
            updated_at: last_time,
        })
        .expect("seed conversation");
}

// ---------------------------------------------------------------------------
// Recording handler shared with the test through an Arc
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Recorded {
    messages: Vec<MessageRow>,
    send_failures: Vec<(String, String)>,
    flushes: Vec<FlushOutcome>,
}

#[derive(Clone, Default)]
struct RecordingHandler(Arc<Mutex<Recorded>>);

impl SyncHandler for RecordingHandler {
    fn on_message(&mut self, message: &MessageRow) {
        self.0.lock().unwrap().messages.push(message.clone());
    }

    fn on_send_failed(&mut self, message: &MessageRow, reason: &str) {
        self.0
            .lock()
            .unwrap()
            .send_failures
            .push((message.message_id.clone(), reason.to_string()));
    }

    fn on_queue_flushed(&mut self, outcome: &FlushOutcome) {
        self.0.lock().unwrap().flushes.push(*outcome);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn offline_send_is_queued_fifo() {
    let mut client = test_client();
    client.set_online(false);

    let first = match client.send("conv-1", "first").expect("send") {
        SendOutcome::Queued(row) => row,
        other => panic!("expected Queued, got {other:?}"),
    };
    let second = match client.send("conv-1", "second").expect("send") {
        SendOutcome::Queued(row) => row,
        other => panic!("expected Queued, got {other:?}"),
    };

    assert_eq!(first.status, "queued");
    assert_eq!(client.storage().outbox_len().expect("len"), 2);

    let queue = client.storage().list_outbox().expect("list");
    assert_eq!(queue[0].local_id, first.message_id);
    assert_eq!(queue[1].local_id, second.message_id);

    // The queued messages are visible in the conversation cache right away.
    let messages = client.messages("conv-1").expect("messages");
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.status == "queued"));
    assert!(messages.iter().all(|m| m.sender == "agent-1"));

    // And the conversation row reflects the latest outgoing message.
    let conv = client
        .storage()
        .get_conversation("conv-1")
        .expect("get")
        .expect("conversation created");
    assert_eq!(conv.last_message, Some("second".to_string()));
}

#[test]
fn flush_is_a_noop_while_offline() {
    let mut client = test_client();
    client.set_online(false);
    client.send("conv-1", "waiting").expect("send");

    let outcome = client.flush_outbox().expect("flush");
    assert_eq!(outcome.sent, 0);
    assert_eq!(outcome.failed, 0);
    assert_eq!(client.storage().outbox_len().expect("len"), 1);

    // The message is still queued, not failed.
    let messages = client.messages("conv-1").expect("messages");
    assert_eq!(messages[0].status, "queued");
}

#[test]
fn reads_fall_back_to_cache_when_backend_unreachable() {
    let mut client = test_client();
    seed_conversation(&client, "conv-cached", 1_000, 3);

    // Online, interval elapsed, backend dead: the refresh fails silently and
    // the cached rows come back.
    let conversations = client.conversations().expect("conversations");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].conversation_id, "conv-cached");
    assert_eq!(conversations[0].unread_count, 3);

    let messages = client.messages("conv-cached").expect("messages");
    assert!(messages.is_empty());
}

#[test]
fn reads_never_touch_network_while_offline() {
    let mut client = test_client();
    client.set_online(false);
    seed_conversation(&client, "conv-cached", 1_000, 0);

    // No refresh attempt happens offline, so no last-sync is recorded.
    client.conversations().expect("conversations");
    assert!(client
        .storage()
        .last_sync("conversations")
        .expect("last_sync")
        .is_none());
}

#[test]
fn online_send_failure_is_final() {
    let mut client = test_client();
    let handler = RecordingHandler::default();
    let recorded = handler.0.clone();
    client.set_handler(Box::new(handler));

    let row = match client.send("conv-1", "doomed").expect("send") {
        SendOutcome::Failed(row) => row,
        other => panic!("expected Failed, got {other:?}"),
    };
    assert_eq!(row.status, "failed");

    // Stored as failed, not queued for retry.
    let stored = client
        .storage()
        .get_message(&row.message_id)
        .expect("get")
        .expect("stored");
    assert_eq!(stored.status, "failed");
    assert_eq!(client.storage().outbox_len().expect("len"), 0);

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.send_failures.len(), 1);
    assert_eq!(recorded.send_failures[0].0, row.message_id);
}

#[test]
fn reconnect_replays_and_clears_queue_even_on_failure() {
    let mut client = test_client();
    let handler = RecordingHandler::default();
    let recorded = handler.0.clone();
    client.set_handler(Box::new(handler));

    client.set_online(false);
    let queued = match client.send("conv-1", "will fail").expect("send") {
        SendOutcome::Queued(row) => row,
        other => panic!("expected Queued, got {other:?}"),
    };

    // Reconnect triggers the replay; the backend is still dead, so the entry
    // leaves the queue as a failed message.
    client.set_online(true);

    assert_eq!(client.storage().outbox_len().expect("len"), 0);
    let stored = client
        .storage()
        .get_message(&queued.message_id)
        .expect("get")
        .expect("still stored");
    assert_eq!(stored.status, "failed");

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.flushes.len(), 1);
    assert_eq!(recorded.flushes[0].failed, 1);
    assert_eq!(recorded.flushes[0].sent, 0);
    assert_eq!(recorded.send_failures.len(), 1);
}

#[test]
fn replay_restores_a_pruned_placeholder_on_failure() {
    let mut client = test_client();
    let handler = RecordingHandler::default();
    let recorded = handler.0.clone();
    client.set_handler(Box::new(handler));

    client.set_online(false);
    let queued = match client.send("conv-1", "pruned away").expect("send") {
        SendOutcome::Queued(row) => row,
        other => panic!("expected Queued, got {other:?}"),
    };

    // Retention can drop the placeholder message while its outbox entry
    // survives.
    client
        .storage()
        .delete_message(&queued.message_id)
        .expect("delete");

    client.set_online(true);

    // The failed replay restored the message so the failure is observable.
    assert_eq!(client.storage().outbox_len().expect("len"), 0);
    let restored = client
        .storage()
        .get_message(&queued.message_id)
        .expect("get")
        .expect("restored");
    assert_eq!(restored.status, "failed");
    assert_eq!(restored.content, "pruned away");

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.send_failures.len(), 1);
    assert_eq!(recorded.send_failures[0].0, queued.message_id);
}

#[test]
fn setting_online_twice_does_not_replay_twice() {
    let mut client = test_client();
    let handler = RecordingHandler::default();
    let recorded = handler.0.clone();
    client.set_handler(Box::new(handler));

    client.set_online(true); // already online, no transition
    client.set_online(true);
    assert!(recorded.lock().unwrap().flushes.is_empty());

    client.set_online(false);
    client.set_online(true); // one transition, one flush
    assert_eq!(recorded.lock().unwrap().flushes.len(), 1);
}
