//! Envelope builders for hub-originated chat events.
//! The hub fans these out; nothing here touches a connection.

use crate::chat::presence::PresenceStatus;
use crate::db::models::Chat;
use crate::ws::envelope::{
    CodecError, Envelope, Header, MessageType, NewChatBody, PresenceBody, TypingBody,
};

/// `online` / `offline` event about `user_id`.
pub fn presence_event(
    user_id: i64,
    status: PresenceStatus,
    last_seen: Option<i64>,
) -> Result<Envelope, CodecError> {
    let kind = match status {
        PresenceStatus::Online => MessageType::Online,
        PresenceStatus::Offline => MessageType::Offline,
    };
    let mut header = Header::server(kind);
    header.sender_id = user_id;
    Envelope::new(
        header,
        &PresenceBody {
            user_id,
            status,
            last_seen,
        },
    )
}

/// `typing` event from `sender_id` in `chat_id`.
pub fn typing_event(sender_id: i64, chat_id: i64, is_typing: bool) -> Result<Envelope, CodecError> {
    let mut header = Header::server(MessageType::Typing);
    header.sender_id = sender_id;
    header.chat_id = Some(chat_id);
    Envelope::new(header, &TypingBody { is_typing })
}

/// `new_chat` event announcing a freshly created chat to its members.
pub fn new_chat_event(chat: &Chat, members: &[i64]) -> Result<Envelope, CodecError> {
    let mut header = Header::server(MessageType::NewChat);
    header.chat_id = Some(chat.id);
    Envelope::new(header, &NewChatBody { chat, members })
}
