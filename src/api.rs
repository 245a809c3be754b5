//! HTTP transport for the CRM backend's WhatsApp endpoints.
//!
//! These functions encapsulate the REST operations the sync layer needs:
//! fetching the conversation list, fetching a conversation's messages, and
//! sending a message.  The backend is an external collaborator; everything
//! here is a thin blocking wrapper with typed wire structs.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    /// Connection-level failure (DNS, refused, timeout).  The sync layer
    /// treats this as "offline" and falls back to cache.
    Transport(String),
    /// The backend answered with a non-success HTTP status.
    Status(u16),
    /// The response body could not be decoded.
    Decode(String),
    /// The request body could not be encoded.
    Encode(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Transport(e) => write!(f, "transport error: {e}"),
            ApiError::Status(code) => write!(f, "backend returned status {code}"),
            ApiError::Decode(e) => write!(f, "decode error: {e}"),
            ApiError::Encode(e) => write!(f, "encode error: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

fn map_ureq_error(error: ureq::Error) -> ApiError {
    match error {
        ureq::Error::Status(code, _) => ApiError::Status(code),
        other => ApiError::Transport(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Conversation as returned by `GET /whatsapp/conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: String,
    #[serde(default)]
    pub contact_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub last_message_time: u64,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Message as returned by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub id: String,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "sent".to_string()
}

/// Body for `POST /whatsapp/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub conversation_id: String,
    pub content: String,
    pub sender: String,
    /// Client-generated reference so the backend can dedupe replays.
    pub client_ref: String,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Fetch the conversation list from the backend.
pub fn fetch_conversations(base_url: &str) -> Result<Vec<RemoteConversation>, ApiError> {
    let url = format!(
        "{}/whatsapp/conversations",
        base_url.trim_end_matches('/')
    );
    let response = ureq::get(&url).call().map_err(map_ureq_error)?;
    response
        .into_json()
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Fetch a conversation's messages, optionally restricted to those at or
/// after `since` (seconds since the epoch).
pub fn fetch_messages(
    base_url: &str,
    conversation_id: &str,
    since: Option<u64>,
) -> Result<Vec<RemoteMessage>, ApiError> {
    let base = base_url.trim_end_matches('/');
    let url = if let Some(since) = since {
        format!("{base}/whatsapp/conversations/{conversation_id}/messages?since={since}")
    } else {
        format!("{base}/whatsapp/conversations/{conversation_id}/messages")
    };
    let response = ureq::get(&url).call().map_err(map_ureq_error)?;
    response
        .into_json()
        .map_err(|e| ApiError::Decode(e.to_string()))
}

/// Send an outgoing message.  Returns the server-confirmed message, whose id
/// supersedes the client-side one.
pub fn send_message(base_url: &str, request: &SendRequest) -> Result<RemoteMessage, ApiError> {
    let url = format!("{}/whatsapp/messages", base_url.trim_end_matches('/'));
    let body = serde_json::to_value(request).map_err(|e| ApiError::Encode(e.to_string()))?;
    let response = ureq::post(&url).send_json(body).map_err(map_ureq_error)?;
    response
        .into_json()
        .map_err(|e| ApiError::Decode(e.to_string()))
}
