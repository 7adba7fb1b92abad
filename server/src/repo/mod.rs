//! Storage collaborators consumed by the hub and the difference engine.
//!
//! The hub only ever sees these traits; `SqliteStore` is the concrete
//! implementation wired up in `main.rs` and in the integration tests.

pub mod sqlite;

use async_trait::async_trait;

use crate::db::models::{
    ChannelSyncState, Chat, ChatKind, Message, NewMessage, SyncState, User,
};

pub use sqlite::SqliteStore;

/// Errors surfaced by repository implementations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// A row with the same unique key already exists (e.g. a redelivered `message_id`).
    #[error("duplicate key")]
    Duplicate,
    #[error("not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert a message and assign it the next `pts`.
    /// Returns `RepoError::Duplicate` if `message_id` was already stored.
    async fn create(&self, message: NewMessage) -> Result<Message, RepoError>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Message>, RepoError>;

    async fn get_by_uuid(&self, message_id: &str) -> Result<Option<Message>, RepoError>;

    /// Replace the content of a message, stamping `edited_at`.
    async fn update_content(
        &self,
        id: i64,
        content: &str,
        edited_at: i64,
    ) -> Result<Message, RepoError>;

    /// Mark every unread message in `chat_id` not sent by `reader_id`
    /// with `pts <= up_to_pts` as read. Returns the number of rows changed.
    ///
    /// Read state is one flag per message: in a group the first member's
    /// receipt marks the message read for the whole chat. Per-member read
    /// positions travel as `read` events and channel sync watermarks.
    async fn mark_read_up_to(
        &self,
        chat_id: i64,
        reader_id: i64,
        up_to_pts: i64,
    ) -> Result<usize, RepoError>;
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn is_member(&self, chat_id: i64, user_id: i64) -> Result<bool, RepoError>;

    async fn get_members(&self, chat_id: i64) -> Result<Vec<i64>, RepoError>;

    /// Look up the private chat between two users, creating it if absent.
    /// The flag is true when the chat was created by this call.
    async fn get_or_create_private_chat(
        &self,
        user_a: i64,
        user_b: i64,
    ) -> Result<(Chat, bool), RepoError>;

    async fn get_by_id(&self, chat_id: i64) -> Result<Option<Chat>, RepoError>;

    async fn create(
        &self,
        kind: ChatKind,
        title: Option<String>,
        created_by: i64,
    ) -> Result<Chat, RepoError>;

    async fn add_member(&self, chat_id: i64, user_id: i64) -> Result<(), RepoError>;

    /// All chat ids the user belongs to.
    async fn chat_ids_for_user(&self, user_id: i64) -> Result<Vec<i64>, RepoError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, user_id: i64) -> Result<Option<User>, RepoError>;

    async fn update_last_seen(&self, user_id: i64, at: i64) -> Result<(), RepoError>;
}

/// Read side of the update log plus the stored watermarks.
#[async_trait]
pub trait SyncRepository: Send + Sync {
    async fn get_state(&self, user_id: i64) -> Result<Option<SyncState>, RepoError>;

    /// Raise the user's watermark to `pts` (never lowers it).
    async fn advance_state(&self, user_id: i64, pts: i64, date: i64) -> Result<SyncState, RepoError>;

    async fn get_channel_state(
        &self,
        user_id: i64,
        chat_id: i64,
    ) -> Result<Option<ChannelSyncState>, RepoError>;

    async fn advance_channel_state(
        &self,
        user_id: i64,
        chat_id: i64,
        pts: i64,
        date: i64,
    ) -> Result<ChannelSyncState, RepoError>;

    /// Non-deleted messages in any of `chat_ids` with `pts > from_pts`,
    /// ascending by `pts`, at most `limit` rows.
    async fn messages_since(
        &self,
        chat_ids: &[i64],
        from_pts: i64,
        limit: usize,
    ) -> Result<Vec<Message>, RepoError>;

    /// Highest `pts` ever assigned, 0 when nothing was stored yet.
    async fn max_pts(&self) -> Result<i64, RepoError>;

    /// Highest `pts` among the chat's non-deleted messages.
    async fn max_chat_pts(&self, chat_id: i64) -> Result<i64, RepoError>;
}
