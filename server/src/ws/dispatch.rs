//! Per-type handling of inbound envelopes.
//!
//! Runs in a task spawned per envelope, never inside the hub loop. Failures
//! stay with the sender: an `error` ack at most, never a broadcast.

use crate::chat::broadcast::{new_chat_event, typing_event};
use crate::db::models::{Chat, NewMessage, MESSAGE_TYPE_VOICE};
use crate::repo::{ChatRepository, MessageRepository, RepoError, UserRepository};
use crate::ws::envelope::{
    AckStatus, Body, ChatMessageBody, EditBody, Envelope, MessageType, ReadBody, TypingBody,
};
use crate::ws::hub::Hub;

impl Hub {
    /// Route one decoded envelope. `header.sender_id` is already the
    /// authenticated user.
    pub async fn dispatch(&self, envelope: Envelope) {
        let body = match envelope.decode_body() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    user_id = envelope.header.sender_id,
                    message_id = %envelope.header.message_id,
                    error = %e,
                    "Dropping envelope with malformed body"
                );
                return;
            }
        };

        match body {
            Body::ChatMessage(body) => self.handle_chat_message(&envelope, body).await,
            Body::Edit(body) => self.handle_edit(&envelope, body).await,
            Body::Typing(body) => self.handle_typing(&envelope, body).await,
            Body::Read(body) => self.handle_read(&envelope, body).await,
            Body::Relay(_) => self.relay(&envelope).await,
            Body::Heartbeat => {}
            Body::Ignored => {
                tracing::debug!(
                    user_id = envelope.header.sender_id,
                    kind = ?envelope.header.kind,
                    "Ignoring envelope type"
                );
            }
        }
    }

    async fn handle_chat_message(&self, envelope: &Envelope, body: ChatMessageBody) {
        let header = &envelope.header;
        let sender_id = header.sender_id;

        if header.message_id.is_empty() {
            tracing::warn!(user_id = sender_id, "Dropping chat message without message_id");
            return;
        }

        let chat_id = match (header.chat_id, header.recipient_id) {
            (Some(chat_id), _) => match self.chats().is_member(chat_id, sender_id).await {
                Ok(true) => chat_id,
                Ok(false) => {
                    self.ack(envelope, AckStatus::Error, Some("not a member of this chat"))
                        .await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(chat_id = chat_id, error = %e, "Membership check failed");
                    self.ack(envelope, AckStatus::Error, Some("internal error")).await;
                    return;
                }
            },
            (None, Some(recipient_id)) if recipient_id == sender_id => {
                self.ack(envelope, AckStatus::Error, Some("cannot message yourself"))
                    .await;
                return;
            }
            (None, Some(recipient_id)) => {
                match self
                    .chats()
                    .get_or_create_private_chat(sender_id, recipient_id)
                    .await
                {
                    Ok((chat, created)) => {
                        if created {
                            self.announce_new_chat(&chat).await;
                        }
                        chat.id
                    }
                    Err(e) => {
                        tracing::warn!(
                            user_id = sender_id,
                            recipient_id = recipient_id,
                            error = %e,
                            "Failed to resolve private chat"
                        );
                        self.ack(envelope, AckStatus::Error, Some("cannot open chat")).await;
                        return;
                    }
                }
            }
            (None, None) => {
                self.ack(envelope, AckStatus::Error, Some("missing chat_id or recipient_id"))
                    .await;
                return;
            }
        };

        if body.message_type == MESSAGE_TYPE_VOICE {
            match self.voice_blocked(chat_id, sender_id).await {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(
                        user_id = sender_id,
                        chat_id = chat_id,
                        "Voice message rejected by recipient settings"
                    );
                    self.ack(envelope, AckStatus::Error, Some("voice messages disabled"))
                        .await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(chat_id = chat_id, error = %e, "Voice permission check failed");
                    self.ack(envelope, AckStatus::Error, Some("internal error")).await;
                    return;
                }
            }
        }

        let new_message = NewMessage {
            message_id: header.message_id.clone(),
            chat_id,
            sender_id,
            message_type: body.message_type,
            content: body.content,
            reply_to: body.reply_to,
            created_at: chrono::Utc::now().timestamp(),
        };

        let stored = match self.messages().create(new_message).await {
            Ok(stored) => stored,
            Err(RepoError::Duplicate) => {
                tracing::debug!(
                    user_id = sender_id,
                    message_id = %header.message_id,
                    "Duplicate message, acknowledging without fan-out"
                );
                self.ack(envelope, AckStatus::Ok, None).await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    user_id = sender_id,
                    message_id = %header.message_id,
                    error = %e,
                    "Failed to persist message"
                );
                self.ack(envelope, AckStatus::Error, Some("failed to store message"))
                    .await;
                return;
            }
        };

        self.ack(envelope, AckStatus::Ok, None).await;

        match Envelope::message(MessageType::ChatMessage, &stored) {
            Ok(outgoing) => self.broadcast_to_chat_members(chat_id, &outgoing).await,
            Err(e) => tracing::warn!(error = %e, "Failed to build message envelope"),
        }
    }

    async fn handle_edit(&self, envelope: &Envelope, body: EditBody) {
        let sender_id = envelope.header.sender_id;
        let message = match self.messages().get_by_uuid(&envelope.header.message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(message_id = %envelope.header.message_id, "Edit of unknown message");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load message for edit");
                return;
            }
        };

        if message.sender_id != sender_id {
            tracing::debug!(
                user_id = sender_id,
                message_id = %message.message_id,
                "Edit by non-author dropped"
            );
            return;
        }

        let now = chrono::Utc::now().timestamp();
        let updated = match self
            .messages()
            .update_content(message.id, &body.content, now)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                tracing::warn!(message_id = %message.message_id, error = %e, "Failed to store edit");
                return;
            }
        };

        match Envelope::message(MessageType::Edit, &updated) {
            Ok(outgoing) => {
                self.broadcast_to_chat_members(updated.chat_id, &outgoing)
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Failed to build edit envelope"),
        }
    }

    async fn handle_typing(&self, envelope: &Envelope, body: TypingBody) {
        let sender_id = envelope.header.sender_id;
        let Some(chat_id) = envelope.header.chat_id else {
            tracing::debug!(user_id = sender_id, "Typing event without chat_id");
            return;
        };

        match self.users().get_by_id(sender_id).await {
            Ok(Some(user)) if user.typing_indicators_enabled => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(user_id = sender_id, error = %e, "Failed to load sender");
                return;
            }
        }

        if !matches!(self.chats().is_member(chat_id, sender_id).await, Ok(true)) {
            tracing::debug!(user_id = sender_id, chat_id = chat_id, "Typing in foreign chat");
            return;
        }

        self.typing().set(sender_id, chat_id, body.is_typing);
        self.fan_out_typing(sender_id, chat_id, body.is_typing).await;
    }

    /// Typing indicators only reach members who share them.
    pub(crate) async fn fan_out_typing(&self, sender_id: i64, chat_id: i64, is_typing: bool) {
        match typing_event(sender_id, chat_id, is_typing) {
            Ok(outgoing) => {
                self.fan_out_where(chat_id, &outgoing, |u| u.typing_indicators_enabled)
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Failed to build typing event"),
        }
    }

    async fn handle_read(&self, envelope: &Envelope, body: ReadBody) {
        let reader_id = envelope.header.sender_id;
        let message = match self.messages().get_by_uuid(&body.message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::debug!(message_id = %body.message_id, "Read receipt for unknown message");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load message for read receipt");
                return;
            }
        };
        let chat_id = message.chat_id;

        if !matches!(self.chats().is_member(chat_id, reader_id).await, Ok(true)) {
            tracing::debug!(user_id = reader_id, chat_id = chat_id, "Read in foreign chat");
            return;
        }

        if let Err(e) = self
            .messages()
            .mark_read_up_to(chat_id, reader_id, message.pts)
            .await
        {
            tracing::warn!(chat_id = chat_id, error = %e, "Failed to mark messages read");
            return;
        }

        // Receipts are reciprocal: hidden senders see none and send none
        match self.users().get_by_id(reader_id).await {
            Ok(Some(reader)) if reader.read_receipts_enabled => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(user_id = reader_id, error = %e, "Failed to load reader");
                return;
            }
        }

        let mut outgoing = envelope.clone();
        outgoing.header.chat_id = Some(chat_id);
        self.fan_out_where(chat_id, &outgoing, |u| u.read_receipts_enabled)
            .await;
    }

    /// 1:1 forward of `delivered` and call signaling.
    async fn relay(&self, envelope: &Envelope) {
        match envelope.header.recipient_id {
            Some(recipient_id) => {
                self.send_to_user(recipient_id, envelope).await;
            }
            None => {
                tracing::debug!(
                    user_id = envelope.header.sender_id,
                    kind = ?envelope.header.kind,
                    "Relay without recipient_id dropped"
                );
            }
        }
    }

    /// Acknowledge `envelope` to every connection of its sender.
    async fn ack(&self, envelope: &Envelope, status: AckStatus, error: Option<&str>) {
        let sender_id = envelope.header.sender_id;
        match Envelope::ack(&envelope.header.message_id, sender_id, status, error) {
            Ok(ack) => {
                self.send_to_user(sender_id, &ack).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to build ack"),
        }
    }

    /// True when some member other than the sender refuses voice messages.
    async fn voice_blocked(&self, chat_id: i64, sender_id: i64) -> Result<bool, RepoError> {
        for member in self.chats().get_members(chat_id).await? {
            if member == sender_id {
                continue;
            }
            if let Some(user) = self.users().get_by_id(member).await? {
                if !user.voice_messages_enabled {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn announce_new_chat(&self, chat: &Chat) {
        let members = match self.chats().get_members(chat.id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(chat_id = chat.id, error = %e, "Failed to load new chat members");
                return;
            }
        };
        let outgoing = match new_chat_event(chat, &members) {
            Ok(outgoing) => outgoing,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to build new chat event");
                return;
            }
        };
        for member in &members {
            self.send_to_user(*member, &outgoing).await;
        }
    }
}
