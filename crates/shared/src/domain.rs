use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

/// Opaque conversation handle issued by the server. Only equality is
/// meaningful; the engine never inspects or orders these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

/// Opaque pagination continuation token. Re-submitting the same cursor yields
/// the same (or an empty) continuation; no other structure is assumed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

/// Local-only identity for an optimistic message awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Server-confirmed composite message identity: a conversation-scoped ordering
/// token plus the message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub sort_key: i64,
    pub id: MessageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::Delivered => 2,
            DeliveryStatus::Read => 3,
            DeliveryStatus::Failed => 4,
        }
    }

    /// Whether a transition to `next` is legal. Status only moves forward
    /// along sending -> sent -> delivered -> read; `Failed` is terminal and
    /// reachable only from `Sending`.
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (DeliveryStatus::Failed, _) => false,
            (DeliveryStatus::Sending, DeliveryStatus::Failed) => true,
            (_, DeliveryStatus::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Document {
        url: String,
        filename: String,
        size_bytes: u64,
    },
    Audio {
        url: String,
        duration_secs: u32,
    },
    Link {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    Offer {
        title: String,
        price_cents: i64,
        currency: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text { body: body.into() }
    }

    /// One-line preview used for the conversation list.
    pub fn preview(&self) -> String {
        match self {
            MessageContent::Text { body } => body.clone(),
            MessageContent::Image { .. } => "[image]".to_string(),
            MessageContent::Document { filename, .. } => format!("[file] {filename}"),
            MessageContent::Audio { .. } => "[audio]".to_string(),
            MessageContent::Link { url, body } => body.clone().unwrap_or_else(|| url.clone()),
            MessageContent::Offer { title, .. } => format!("[offer] {title}"),
        }
    }
}

/// Best-effort metadata fetched for a link after the send completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPreview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}
