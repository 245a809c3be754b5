use std::env;
use std::error::Error;

use chatsync::logging;
use chatsync::storage::{db_path, resolve_data_dir, CacheSettings, Storage};
use chatsync::sync::{SendOutcome, SyncClient, SyncConfig};

fn main() {
    logging::init();
    if let Err(error) = run() {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let mut args = env::args().collect::<Vec<String>>();
    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    let command = args[1].clone();
    let command_args = args.split_off(2);

    match command.as_str() {
        "conversations" => list_conversations(&command_args),
        "messages" => list_messages(&command_args),
        "send" => send(&command_args),
        "sync" => sync(&command_args),
        "flush" => flush(&command_args),
        "settings" => settings(&command_args),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!(
        "chatsync commands:\n\
         \n\
         conversations [--api <url>]\n\
         messages <conversation_id> [--api <url>]\n\
         send <conversation_id> <message> [--api <url>] [--offline]\n\
         sync [--api <url>]\n\
         flush [--api <url>]\n\
         settings [<key> <value>]\n\
         \n\
         Environment:\n\
         CHATSYNC_HOME defaults to .chatsync\n\
         CHATSYNC_API_URL provides the backend base URL default\n\
         CHATSYNC_AGENT_ID names the sender of outgoing messages"
    );
}

/// Parse `--api` / `--offline` out of the argument list; everything else is
/// returned as positional arguments.
fn parse_common(args: &[String]) -> Result<(Vec<String>, Option<String>, bool), Box<dyn Error>> {
    let mut api_url = env::var("CHATSYNC_API_URL").ok();
    let mut offline = false;
    let mut positional = Vec::new();

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "--api" => {
                index += 1;
                if index >= args.len() {
                    return Err("--api requires a URL".into());
                }
                api_url = Some(args[index].clone());
            }
            "--offline" => offline = true,
            value => positional.push(value.to_string()),
        }
        index += 1;
    }
    Ok((positional, api_url, offline))
}

fn open_client(api_url: Option<String>, offline: bool) -> Result<SyncClient, Box<dyn Error>> {
    let api_url = api_url.ok_or("backend URL required (use --api or CHATSYNC_API_URL)")?;
    let agent_id = env::var("CHATSYNC_AGENT_ID").unwrap_or_else(|_| "agent".to_string());
    let storage = Storage::open(&db_path(&resolve_data_dir()))?;
    let mut client = SyncClient::new(storage, SyncConfig::new(api_url, agent_id));
    if offline {
        client.set_online(false);
    }
    Ok(client)
}

fn list_conversations(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (_, api_url, offline) = parse_common(args)?;
    let mut client = open_client(api_url, offline)?;

    let conversations = client.conversations()?;
    if conversations.is_empty() {
        println!("no conversations cached");
        return Ok(());
    }
    for conv in conversations {
        let name = conv
            .contact_name
            .as_deref()
            .unwrap_or(conv.conversation_id.as_str());
        let preview = conv.last_message.as_deref().unwrap_or("");
        println!(
            "{:<24} unread={:<3} last={:<12} {}",
            name, conv.unread_count, conv.last_message_time, preview
        );
    }
    Ok(())
}

fn list_messages(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (positional, api_url, offline) = parse_common(args)?;
    let conversation_id = positional
        .first()
        .ok_or("messages requires <conversation_id>")?;
    let mut client = open_client(api_url, offline)?;

    let messages = client.messages(conversation_id)?;
    if messages.is_empty() {
        println!("no messages cached for {conversation_id}");
        return Ok(());
    }
    for msg in messages {
        println!(
            "[{}] {} ({}): {}",
            msg.timestamp, msg.sender, msg.status, msg.content
        );
    }
    client.storage().mark_conversation_read(conversation_id)?;
    Ok(())
}

fn send(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (positional, api_url, offline) = parse_common(args)?;
    let conversation_id = positional.first().ok_or("send requires <conversation_id>")?;
    let message = positional[1..].join(" ");
    if message.trim().is_empty() {
        return Err("send requires a message".into());
    }
    let mut client = open_client(api_url, offline)?;

    match client.send(conversation_id, &message)? {
        SendOutcome::Sent(row) => println!("sent message {}", row.message_id),
        SendOutcome::Queued(row) => println!("offline, queued message {}", row.message_id),
        SendOutcome::Failed(row) => {
            println!("send failed, stored message {} as failed", row.message_id)
        }
    }
    Ok(())
}

fn sync(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (_, api_url, _) = parse_common(args)?;
    let mut client = open_client(api_url, false)?;

    let report = client.sync_now()?;
    println!(
        "synced {} conversation(s), {} new message(s), {} failed",
        report.conversations_fetched, report.messages_added, report.conversations_failed
    );
    Ok(())
}

fn flush(args: &[String]) -> Result<(), Box<dyn Error>> {
    let (_, api_url, _) = parse_common(args)?;
    let mut client = open_client(api_url, false)?;

    let queued = client.storage().outbox_len()?;
    if queued == 0 {
        println!("outgoing queue is empty");
        return Ok(());
    }
    let outcome = client.flush_outbox()?;
    println!("replayed queue: {} sent, {} failed", outcome.sent, outcome.failed);
    Ok(())
}

fn settings(args: &[String]) -> Result<(), Box<dyn Error>> {
    let storage = Storage::open(&db_path(&resolve_data_dir()))?;
    let current = storage.load_settings()?;

    if args.is_empty() {
        println!("max_conversations = {}", current.max_conversations);
        println!(
            "max_messages_per_conversation = {}",
            current.max_messages_per_conversation
        );
        println!("retention_days = {}", current.retention_days);
        println!("sync_interval_secs = {}", current.sync_interval_secs);
        return Ok(());
    }

    if args.len() != 2 {
        return Err("settings takes no arguments, or <key> <value>".into());
    }
    let key = args[0].as_str();
    let value = &args[1];
    let mut updated: CacheSettings = current;
    match key {
        "max_conversations" => updated.max_conversations = value.parse()?,
        "max_messages_per_conversation" => {
            updated.max_messages_per_conversation = value.parse()?
        }
        "retention_days" => updated.retention_days = value.parse()?,
        "sync_interval_secs" => updated.sync_interval_secs = value.parse()?,
        _ => return Err(format!("unknown setting: {key}").into()),
    }
    storage.store_settings(&updated)?;
    println!("{key} = {value}");
    Ok(())
}
