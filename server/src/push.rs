//! Offline push trigger contract.
//!
//! Delivery mechanics (APNs/FCM credentials, retries) live outside this
//! server. The hub only calls `send_notification` once per offline
//! recipient of a chat message.

use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push provider error: {0}")]
    Provider(String),
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn send_notification(
        &self,
        user_id: i64,
        title: &str,
        body: &str,
        data: HashMap<String, String>,
    ) -> Result<(), PushError>;
}

/// Notifier used when no provider is configured: records the trigger in the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl PushNotifier for LogNotifier {
    async fn send_notification(
        &self,
        user_id: i64,
        title: &str,
        body: &str,
        data: HashMap<String, String>,
    ) -> Result<(), PushError> {
        tracing::info!(
            user_id = user_id,
            title = %title,
            body_len = body.len(),
            data = ?data,
            "Push notification triggered"
        );
        Ok(())
    }
}

/// Maximum characters of message content carried in a notification body.
const PREVIEW_CHARS: usize = 100;

/// Build the notification body for a chat message.
pub fn preview(message_type: &str, content: &str) -> String {
    match message_type {
        "voice" => "Voice message".to_string(),
        "image" => "Photo".to_string(),
        "video" => "Video".to_string(),
        "file" => "File".to_string(),
        _ => {
            let mut preview: String = content.chars().take(PREVIEW_CHARS).collect();
            if content.chars().count() > PREVIEW_CHARS {
                preview.push('…');
            }
            preview
        }
    }
}
