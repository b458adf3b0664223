use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    ConversationId, Cursor, DeliveryStatus, LinkPreview, MessageContent, MessageId, MessageKey,
    UserId,
};

/// Per-emoji reactor sets. The server is the source of truth; the whole map is
/// replaced on every reaction event.
pub type ReactionMap = BTreeMap<String, BTreeSet<UserId>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    pub online: bool,
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_status: Option<DeliveryStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub items: Vec<ConversationSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

/// A message as the server reports it. Arrival order within a page is an
/// implementation detail of the backend and must not be relied on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageKey>,
    #[serde(default, skip_serializing_if = "ReactionMap::is_empty")]
    pub reactions: ReactionMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub items: Vec<MessageRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConversationRequest {
    pub peer_id: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConversationResponse {
    pub conversation_id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<MessageKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: MessageId,
    pub sort_key: i64,
    pub created_at: DateTime<Utc>,
}

/// Push-channel events. Unknown tags must be tolerated by consumers: frames
/// are decoded through [`PushFrame`] so an unrecognized `type` is surfaced as
/// such instead of failing the whole stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage {
        message: MessageRecord,
    },
    MessageDelivered {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessageRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
    MessageEdited {
        conversation_id: ConversationId,
        key: MessageKey,
        content: MessageContent,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        key: MessageKey,
    },
    ReactionUpdated {
        conversation_id: ConversationId,
        key: MessageKey,
        reactions: ReactionMap,
    },
    ConversationUpdated {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        preview: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message_status: Option<DeliveryStatus>,
        #[serde(default)]
        unread_increment: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        typing: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        online: Option<bool>,
    },
    SendAcknowledged {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
}

/// Raw inbound frame: the tag is always readable even when the payload shape
/// is unknown to this client version.
#[derive(Debug, Clone, Deserialize)]
pub struct PushFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AckAction {
    AckDelivered,
    AckRead,
}

/// Outbound acknowledgment frame, `{action, conversationId, messageIds[]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    pub action: AckAction,
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReactRequest {
    pub emoji: String,
    pub add: bool,
}

/// Preview payload returned by the link-metadata collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkPreviewResponse {
    #[serde(flatten)]
    pub preview: LinkPreview,
}
