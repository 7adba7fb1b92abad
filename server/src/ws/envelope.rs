//! JSON wire envelope: a header plus a body whose shape depends on the
//! header's `type`.
//!
//! Decoding is two-phase. `decode` parses the header and keeps the body as
//! raw JSON; `Envelope::decode_body` turns it into a typed [`Body`] once the
//! caller has looked at the tag.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::chat::presence::PresenceStatus;
use crate::db::models::{Chat, Message};

pub const PROTOCOL_VERSION: &str = "1.0";

/// Envelope type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ChatMessage,
    Edit,
    Typing,
    Delivered,
    Read,
    CallOffer,
    CallAnswer,
    IceCandidate,
    CallCancel,
    CallBusy,
    CallEnd,
    Heartbeat,
    Ack,
    Online,
    Offline,
    NewChat,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Call-setup types relayed 1:1 without persistence.
    pub fn is_signaling(&self) -> bool {
        matches!(
            self,
            Self::CallOffer
                | Self::CallAnswer
                | Self::IceCandidate
                | Self::CallCancel
                | Self::CallBusy
                | Self::CallEnd
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub sender_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<i64>,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Header {
    /// Header for a server-originated envelope with a fresh message id.
    pub fn server(kind: MessageType) -> Self {
        Self {
            version: default_version(),
            kind,
            message_id: uuid::Uuid::now_v7().to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            sender_id: 0,
            recipient_id: None,
            chat_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    #[serde(default)]
    pub body: Option<Box<RawValue>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("malformed {kind:?} body: {source}")]
    Body {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Parse a frame into an envelope. The body stays undecoded.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    serde_json::from_slice(bytes).map_err(CodecError::Malformed)
}

/// Serialize an envelope into a text frame payload.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(CodecError::Encode)
}

// --- Body shapes ---

fn default_message_type() -> String {
    "text".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessageBody {
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditBody {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingBody {
    pub is_typing: bool,
}

/// Body of a `read` envelope: the newest message the reader has seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadBody {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBody {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceBody {
    pub user_id: i64,
    pub status: PresenceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewChatBody<'a> {
    pub chat: &'a Chat,
    pub members: &'a [i64],
}

/// Typed body, decoded after the header tag is known.
#[derive(Debug, Clone)]
pub enum Body {
    ChatMessage(ChatMessageBody),
    Edit(EditBody),
    Typing(TypingBody),
    Read(ReadBody),
    /// `delivered` and call signaling: forwarded verbatim.
    Relay(Option<Box<RawValue>>),
    Heartbeat,
    /// Server-only or unrecognised tag.
    Ignored,
}

impl Envelope {
    /// Build an envelope around a serializable body.
    pub fn new<T: Serialize>(header: Header, body: &T) -> Result<Self, CodecError> {
        let body = serde_json::value::to_raw_value(body).map_err(CodecError::Encode)?;
        Ok(Self {
            header,
            body: Some(body),
        })
    }

    /// `ack` for `message_id`, addressed to `recipient`.
    pub fn ack(
        message_id: &str,
        recipient: i64,
        status: AckStatus,
        error: Option<&str>,
    ) -> Result<Self, CodecError> {
        let mut header = Header::server(MessageType::Ack);
        header.message_id = message_id.to_string();
        header.recipient_id = Some(recipient);
        Self::new(
            header,
            &AckBody {
                status,
                error: error.map(str::to_string),
            },
        )
    }

    /// Envelope carrying a stored message, as fanned out and replayed.
    pub fn message(kind: MessageType, message: &Message) -> Result<Self, CodecError> {
        let header = Header {
            version: default_version(),
            kind,
            message_id: message.message_id.clone(),
            timestamp: message.edited_at.unwrap_or(message.created_at),
            sender_id: message.sender_id,
            recipient_id: None,
            chat_id: Some(message.chat_id),
        };
        Self::new(header, message)
    }

    /// Decode the body as `T`. A missing body decodes from `{}`.
    pub fn body_as<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let raw = self.body.as_deref().map(RawValue::get).unwrap_or("{}");
        serde_json::from_str(raw).map_err(|source| CodecError::Body {
            kind: self.header.kind,
            source,
        })
    }

    /// Decode the body into the shape selected by the header tag.
    pub fn decode_body(&self) -> Result<Body, CodecError> {
        let kind = self.header.kind;
        let body = match kind {
            MessageType::ChatMessage => Body::ChatMessage(self.body_as()?),
            MessageType::Edit => Body::Edit(self.body_as()?),
            MessageType::Typing => Body::Typing(self.body_as()?),
            MessageType::Read => Body::Read(self.body_as()?),
            MessageType::Heartbeat => Body::Heartbeat,
            MessageType::Delivered => Body::Relay(self.body.clone()),
            k if k.is_signaling() => Body::Relay(self.body.clone()),
            _ => Body::Ignored,
        };
        Ok(body)
    }
}
