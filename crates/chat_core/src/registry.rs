use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{ConversationId, DeliveryStatus, UserId};
use shared::protocol::ConversationSnapshot;
use tracing::debug;

/// Row of the conversation list as presented to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub peer_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub online: bool,
    pub unread_count: u32,
    pub last_message_status: Option<DeliveryStatus>,
    pub typing: bool,
}

impl From<ConversationSnapshot> for ConversationSummary {
    fn from(snapshot: ConversationSnapshot) -> Self {
        Self {
            conversation_id: snapshot.conversation_id,
            peer_id: snapshot.peer_id,
            display_name: snapshot.display_name,
            avatar_url: snapshot.avatar_url,
            last_message_preview: snapshot.last_message_preview,
            last_message_at: snapshot.last_message_at,
            online: snapshot.online,
            unread_count: snapshot.unread_count,
            last_message_status: snapshot.last_message_status,
            typing: false,
        }
    }
}

/// Activity update that floats a conversation to the front of the list.
#[derive(Debug, Clone)]
pub struct TouchUpdate {
    pub preview: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub status: Option<DeliveryStatus>,
    /// `0` means the conversation is currently open: unread resets to zero.
    /// Any other value increments the unread count.
    pub unread_delta: u32,
}

/// Ordered, deduplicated collection of conversation summaries. Exactly one
/// entry exists per peer identity, and the list is kept sorted by last
/// activity, most recent first.
#[derive(Debug, Default)]
pub struct ConversationRegistry {
    order: Vec<UserId>,
    entries: HashMap<UserId, ConversationSummary>,
    by_conversation: HashMap<ConversationId, UserId>,
}

impl ConversationRegistry {
    /// Merge a page of summaries. The initial page replaces the list and is
    /// re-sorted by recency; follow-up pages are assumed already older and
    /// appended in arrival order, dropping peers already present (first
    /// occurrence wins its position).
    pub fn load_page(&mut self, items: Vec<ConversationSummary>, is_initial: bool) {
        if is_initial {
            self.order.clear();
            self.entries.clear();
            self.by_conversation.clear();
        }

        for summary in items {
            if self.entries.contains_key(&summary.peer_id) {
                continue;
            }
            self.by_conversation
                .insert(summary.conversation_id.clone(), summary.peer_id);
            self.order.push(summary.peer_id);
            self.entries.insert(summary.peer_id, summary);
        }

        if is_initial {
            let entries = &self.entries;
            self.order.sort_by(|a, b| {
                let at = entries.get(a).and_then(|s| s.last_message_at);
                let bt = entries.get(b).and_then(|s| s.last_message_at);
                bt.cmp(&at)
            });
        }
    }

    /// Move-or-insert the conversation to the front and fold in the activity
    /// update. Returns `false` when the conversation is unknown, in which
    /// case nothing is recorded: an event for a not-yet-paged-in conversation
    /// is expected to resolve itself once that page loads.
    pub fn touch(&mut self, conversation_id: &ConversationId, update: TouchUpdate) -> bool {
        let Some(peer_id) = self.by_conversation.get(conversation_id).copied() else {
            debug!(
                conversation_id = %conversation_id.0,
                "touch for unknown conversation dropped"
            );
            return false;
        };

        let Some(summary) = self.entries.get_mut(&peer_id) else {
            return false;
        };
        if update.preview.is_some() {
            summary.last_message_preview = update.preview;
        }
        summary.last_message_at = Some(update.timestamp);
        if update.status.is_some() {
            summary.last_message_status = update.status;
        }
        if update.unread_delta == 0 {
            summary.unread_count = 0;
        } else {
            summary.unread_count = summary.unread_count.saturating_add(update.unread_delta);
        }
        self.move_to_front(peer_id);
        true
    }

    /// Insert a summary at the front of the list, used when the first
    /// outgoing message targets a peer the list has never seen.
    pub fn insert_front(&mut self, summary: ConversationSummary) {
        if self.entries.contains_key(&summary.peer_id) {
            self.move_to_front(summary.peer_id);
            return;
        }
        self.by_conversation
            .insert(summary.conversation_id.clone(), summary.peer_id);
        self.order.insert(0, summary.peer_id);
        self.entries.insert(summary.peer_id, summary);
    }

    /// Reset the unread count without touching the ordering.
    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> bool {
        match self.summary_mut(conversation_id) {
            Some(summary) => {
                summary.unread_count = 0;
                true
            }
            None => false,
        }
    }

    pub fn set_typing(&mut self, conversation_id: &ConversationId, typing: bool) -> bool {
        match self.summary_mut(conversation_id) {
            Some(summary) => {
                summary.typing = typing;
                true
            }
            None => false,
        }
    }

    pub fn set_online(&mut self, conversation_id: &ConversationId, online: bool) -> bool {
        match self.summary_mut(conversation_id) {
            Some(summary) => {
                summary.online = online;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.by_conversation.contains_key(conversation_id)
    }

    pub fn conversation_of(&self, peer_id: UserId) -> Option<ConversationId> {
        self.entries
            .get(&peer_id)
            .map(|summary| summary.conversation_id.clone())
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        let peer_id = self.by_conversation.get(conversation_id)?;
        self.entries.get(peer_id)
    }

    /// Current list contents in display order, most recent first.
    pub fn snapshot(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|peer_id| self.entries.get(peer_id))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn summary_mut(&mut self, conversation_id: &ConversationId) -> Option<&mut ConversationSummary> {
        let peer_id = self.by_conversation.get(conversation_id)?;
        self.entries.get_mut(peer_id)
    }

    fn move_to_front(&mut self, peer_id: UserId) {
        if let Some(position) = self.order.iter().position(|id| *id == peer_id) {
            self.order.remove(position);
        }
        self.order.insert(0, peer_id);
    }
}
