/// Database row types.
/// These correspond 1:1 to the SQLite schema defined in migrations.rs.
use serde::{Deserialize, Serialize};

/// User record in the users table, including the privacy flags the
/// dispatcher consults for typing, read receipts and voice messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub last_seen: Option<i64>,
    pub typing_indicators_enabled: bool,
    pub read_receipts_enabled: bool,
    pub voice_messages_enabled: bool,
    pub created_at: i64,
}

/// Chat kind stored in chats.kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(Self::Private),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// Chat record in the chats table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chat {
    pub id: i64,
    pub kind: ChatKind,
    pub title: Option<String>,
    pub created_by: i64,
    pub created_at: i64,
}

/// Persisted message. `message_id` is the client-chosen idempotence key,
/// `pts` its position in the global update sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: i64,
    pub message_id: String,
    pub chat_id: i64,
    pub sender_id: i64,
    pub message_type: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub pts: i64,
    pub is_read: bool,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<i64>,
}

/// Insert payload for a new message. `pts` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub chat_id: i64,
    pub sender_id: i64,
    pub message_type: String,
    pub content: String,
    pub reply_to: Option<String>,
    pub created_at: i64,
}

/// Message type tag for voice notes (gated by recipients' preferences)
pub const MESSAGE_TYPE_VOICE: &str = "voice";

/// Per-user watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub pts: i64,
    pub date: i64,
}

/// Per-(user, chat) watermark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelSyncState {
    pub user_id: i64,
    pub chat_id: i64,
    pub pts: i64,
    pub date: i64,
}
