use serde::Serialize;
use std::sync::Arc;

use crate::config::SyncConfig;
use crate::db::models::{Message, SyncState};
use crate::repo::{ChatRepository, SyncRepository};
use crate::sync::SyncError;

/// Messages after a global watermark plus the watermark to store next.
#[derive(Debug, Clone, Serialize)]
pub struct Difference {
    pub new_messages: Vec<Message>,
    pub state: SyncState,
}

/// One chat's messages after a watermark.
/// `is_final` is false when more rows remain past this page.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDifference {
    #[serde(rename = "final")]
    pub is_final: bool,
    pub new_messages: Vec<Message>,
    pub pts: i64,
}

/// Read-only view over the `pts`-ordered message log.
///
/// Both difference queries are pure reads: asking twice with the same
/// `from_pts` returns the same page. Watermarks only move through the
/// `commit_*` calls, which never lower them.
#[derive(Clone)]
pub struct DifferenceEngine {
    chats: Arc<dyn ChatRepository>,
    sync: Arc<dyn SyncRepository>,
    config: SyncConfig,
}

impl DifferenceEngine {
    pub fn new(
        chats: Arc<dyn ChatRepository>,
        sync: Arc<dyn SyncRepository>,
        config: SyncConfig,
    ) -> Self {
        Self {
            chats,
            sync,
            config,
        }
    }

    /// Missing or non-positive limits use the default; all are capped at `max`.
    fn clamp_limit(&self, requested: Option<i64>, max: i64) -> usize {
        let limit = match requested {
            Some(limit) if limit > 0 => limit,
            _ => self.config.default_limit,
        };
        limit.clamp(1, max.max(1)) as usize
    }

    /// Stored watermark, or `{0, now}` for a user who never synced.
    pub async fn get_state(&self, user_id: i64) -> Result<SyncState, SyncError> {
        Ok(self
            .sync
            .get_state(user_id)
            .await?
            .unwrap_or_else(|| SyncState {
                pts: 0,
                date: chrono::Utc::now().timestamp(),
            }))
    }

    /// Messages in any of the user's chats with `pts > from_pts`, ascending.
    pub async fn get_difference(
        &self,
        user_id: i64,
        from_pts: i64,
        limit: Option<i64>,
    ) -> Result<Difference, SyncError> {
        let limit = self.clamp_limit(limit, self.config.max_difference_limit);
        let chat_ids = self.chats.chat_ids_for_user(user_id).await?;
        let new_messages = self.sync.messages_since(&chat_ids, from_pts, limit).await?;

        let pts = match new_messages.last() {
            Some(last) => last.pts,
            None => self.sync.max_pts().await?.max(from_pts),
        };

        Ok(Difference {
            new_messages,
            state: SyncState {
                pts,
                date: chrono::Utc::now().timestamp(),
            },
        })
    }

    /// One chat's messages with `pts > from_pts`, ascending.
    pub async fn get_channel_difference(
        &self,
        user_id: i64,
        chat_id: i64,
        from_pts: i64,
        limit: Option<i64>,
    ) -> Result<ChannelDifference, SyncError> {
        if !self.chats.is_member(chat_id, user_id).await? {
            return Err(SyncError::NotMember(chat_id));
        }

        let limit = self.clamp_limit(limit, self.config.max_channel_difference_limit);
        // One extra row tells whether another page exists
        let mut new_messages = self
            .sync
            .messages_since(&[chat_id], from_pts, limit + 1)
            .await?;
        let is_final = new_messages.len() <= limit;
        new_messages.truncate(limit);

        // Soft deletes can leave the chat's live maximum below `from_pts`
        let pts = match new_messages.last() {
            Some(last) => last.pts,
            None => self.sync.max_chat_pts(chat_id).await?.max(from_pts),
        };

        Ok(ChannelDifference {
            is_final,
            new_messages,
            pts,
        })
    }

    /// Store `state` if it moves past the watermark the client asked from.
    /// Returns the stored watermark, or None when nothing was written.
    pub async fn commit_state(
        &self,
        user_id: i64,
        from_pts: i64,
        state: SyncState,
    ) -> Result<Option<SyncState>, SyncError> {
        if state.pts <= from_pts {
            return Ok(None);
        }
        let stored = self.sync.advance_state(user_id, state.pts, state.date).await?;
        Ok(Some(stored))
    }

    pub async fn commit_channel_state(
        &self,
        user_id: i64,
        chat_id: i64,
        from_pts: i64,
        pts: i64,
    ) -> Result<Option<i64>, SyncError> {
        if pts <= from_pts {
            return Ok(None);
        }
        let stored = self
            .sync
            .advance_channel_state(user_id, chat_id, pts, chrono::Utc::now().timestamp())
            .await?;
        Ok(Some(stored.pts))
    }
}
