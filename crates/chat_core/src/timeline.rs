use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::domain::{
    DeliveryStatus, LinkPreview, MessageContent, MessageId, MessageKey, TempId, UserId,
};
use shared::protocol::{MessageRecord, ReactionMap};
use tracing::trace;

/// How long an optimistic message stays eligible for matching against a push
/// echo of the same content. Past this window the echo is treated as a new
/// message.
pub const ECHO_MATCH_WINDOW_SECS: i64 = 30;

/// A message is either confirmed by the server or still local-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageIdentity {
    Confirmed(MessageKey),
    Local(TempId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub identity: MessageIdentity,
    pub sender_id: UserId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub reply_to: Option<MessageKey>,
    pub reactions: ReactionMap,
    pub link_preview: Option<LinkPreview>,
}

impl Message {
    /// Local placeholder inserted before the send round trip completes.
    pub fn optimistic(
        temp_id: TempId,
        sender_id: UserId,
        content: MessageContent,
        created_at: DateTime<Utc>,
        reply_to: Option<MessageKey>,
    ) -> Self {
        Self {
            identity: MessageIdentity::Local(temp_id),
            sender_id,
            content,
            created_at,
            status: DeliveryStatus::Sending,
            reply_to,
            reactions: ReactionMap::new(),
            link_preview: None,
        }
    }

    pub fn from_record(record: MessageRecord, is_mine: bool) -> Self {
        let status = if is_mine {
            if record.read_at.is_some() {
                DeliveryStatus::Read
            } else {
                DeliveryStatus::Delivered
            }
        } else {
            DeliveryStatus::Read
        };
        Self {
            identity: MessageIdentity::Confirmed(record.key),
            sender_id: record.sender_id,
            content: record.content,
            created_at: record.created_at,
            status,
            reply_to: record.reply_to,
            reactions: record.reactions,
            link_preview: None,
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self.identity {
            MessageIdentity::Confirmed(key) => Some(key.id),
            MessageIdentity::Local(_) => None,
        }
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self.identity {
            MessageIdentity::Local(temp_id) => Some(temp_id),
            MessageIdentity::Confirmed(_) => None,
        }
    }

    fn sort_token(&self) -> (DateTime<Utc>, i64) {
        match self.identity {
            MessageIdentity::Confirmed(key) => (self.created_at, key.sort_key),
            // Local messages sort after confirmed ones at the same instant.
            MessageIdentity::Local(_) => (self.created_at, i64::MAX),
        }
    }
}

/// Scroll handling hint emitted alongside a timeline change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportInstruction {
    JumpToNewest,
    PreserveScrollPosition { prepended: usize },
    StickToBottom,
}

/// Ordered message history for one conversation. Messages live in a slot
/// arena; `order` holds slot indices oldest-first and the id maps point back
/// into the arena, so reconciling an optimistic send rewrites a slot in place
/// without disturbing neighbors.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    slots: Vec<Option<Message>>,
    order: Vec<usize>,
    by_id: HashMap<MessageId, usize>,
    by_temp: HashMap<TempId, usize>,
}

impl MessageTimeline {
    /// Replace the whole timeline with the newest page of history.
    pub fn load_initial(
        &mut self,
        records: Vec<MessageRecord>,
        self_id: UserId,
    ) -> ViewportInstruction {
        self.slots.clear();
        self.order.clear();
        self.by_id.clear();
        self.by_temp.clear();

        let mut batch = Self::sorted_batch(records);
        for record in batch.drain(..) {
            let is_mine = record.sender_id == self_id;
            self.push_back(Message::from_record(record, is_mine));
        }
        ViewportInstruction::JumpToNewest
    }

    /// Prepend an older page. Records already present are dropped, and the
    /// instruction carries how many rows landed above the viewport.
    pub fn load_older(
        &mut self,
        records: Vec<MessageRecord>,
        self_id: UserId,
    ) -> ViewportInstruction {
        let batch = Self::sorted_batch(records);
        let mut prepended = 0;
        for record in batch.into_iter().rev() {
            if self.by_id.contains_key(&record.key.id) {
                continue;
            }
            let is_mine = record.sender_id == self_id;
            let slot = self.alloc(Message::from_record(record, is_mine));
            self.order.insert(0, slot);
            prepended += 1;
        }
        ViewportInstruction::PreserveScrollPosition { prepended }
    }

    /// Append a message that just arrived over the push channel. Returns the
    /// viewport hint, or `None` when the message was already present.
    pub fn append_live(
        &mut self,
        record: MessageRecord,
        is_mine: bool,
    ) -> Option<ViewportInstruction> {
        if self.by_id.contains_key(&record.key.id) {
            trace!(message_id = record.key.id.0, "duplicate live message dropped");
            return None;
        }
        self.push_back(Message::from_record(record, is_mine));
        Some(ViewportInstruction::StickToBottom)
    }

    pub fn insert_optimistic(&mut self, message: Message) -> ViewportInstruction {
        if let MessageIdentity::Local(temp_id) = message.identity {
            if self.by_temp.contains_key(&temp_id) {
                return ViewportInstruction::StickToBottom;
            }
        }
        self.push_back(message);
        ViewportInstruction::StickToBottom
    }

    /// Swap an optimistic message's identity for its server-confirmed key,
    /// leaving its position untouched. If a push echo already registered the
    /// same id, the local copy is removed instead so the message appears once.
    pub fn reconcile_optimistic(
        &mut self,
        temp_id: TempId,
        key: MessageKey,
        created_at: DateTime<Utc>,
    ) -> bool {
        let Some(slot) = self.by_temp.remove(&temp_id) else {
            return false;
        };
        if self.by_id.contains_key(&key.id) {
            self.release(slot);
            return true;
        }
        if let Some(message) = self.slots[slot].as_mut() {
            message.identity = MessageIdentity::Confirmed(key);
            message.created_at = created_at;
            if message.status.can_advance_to(DeliveryStatus::Sent) {
                message.status = DeliveryStatus::Sent;
            }
            self.by_id.insert(key.id, slot);
        }
        true
    }

    /// Find an unconfirmed optimistic message that a push echo most plausibly
    /// confirms: same sender, identical content, created within the match
    /// window.
    pub fn match_unconfirmed(&self, record: &MessageRecord) -> Option<TempId> {
        self.order.iter().rev().find_map(|&slot| {
            let message = self.slots[slot].as_ref()?;
            let temp_id = message.temp_id()?;
            if message.status != DeliveryStatus::Sending {
                return None;
            }
            if message.sender_id != record.sender_id || message.content != record.content {
                return None;
            }
            let delta = (record.created_at - message.created_at).num_seconds().abs();
            (delta <= ECHO_MATCH_WINDOW_SECS).then_some(temp_id)
        })
    }

    /// Replace a message's content in place. Unknown keys are a silent no-op:
    /// the edited message may simply not be paged in.
    pub fn apply_edit(&mut self, key: MessageKey, content: MessageContent) -> bool {
        match self.confirmed_mut(key.id) {
            Some(message) => {
                message.content = content;
                true
            }
            None => false,
        }
    }

    pub fn apply_delete(&mut self, key: MessageKey) -> bool {
        let Some(slot) = self.by_id.remove(&key.id) else {
            return false;
        };
        self.release(slot);
        true
    }

    /// Replace the reaction map wholesale with the server's version.
    pub fn apply_reactions(&mut self, key: MessageKey, reactions: ReactionMap) -> bool {
        match self.confirmed_mut(key.id) {
            Some(message) => {
                message.reactions = reactions;
                true
            }
            None => false,
        }
    }

    /// Advance delivery status for the given ids, skipping any transition the
    /// forward-only rule forbids. Returns whether anything changed.
    pub fn advance_status(&mut self, ids: &[MessageId], status: DeliveryStatus) -> bool {
        let mut changed = false;
        for id in ids {
            if let Some(message) = self.confirmed_mut(*id) {
                if message.status.can_advance_to(status) {
                    message.status = status;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Mark an optimistic message as failed. Terminal: the message stays
    /// visible for inspection and manual re-send but never retries itself.
    pub fn fail(&mut self, temp_id: TempId) -> bool {
        let Some(&slot) = self.by_temp.get(&temp_id) else {
            return false;
        };
        match self.slots[slot].as_mut() {
            Some(message) if message.status.can_advance_to(DeliveryStatus::Failed) => {
                message.status = DeliveryStatus::Failed;
                true
            }
            _ => false,
        }
    }

    pub fn attach_link_preview(&mut self, id: MessageId, preview: LinkPreview) -> bool {
        match self.confirmed_mut(id) {
            Some(message) => {
                message.link_preview = Some(preview);
                true
            }
            None => false,
        }
    }

    /// Fold the newest server page into the timeline after a reconnect,
    /// keeping everything already present. Returns how many messages were new.
    pub fn merge_latest(&mut self, records: Vec<MessageRecord>, self_id: UserId) -> usize {
        let mut inserted = 0;
        for record in Self::sorted_batch(records) {
            if self.by_id.contains_key(&record.key.id) {
                continue;
            }
            if let Some(temp_id) = self.match_unconfirmed(&record) {
                self.reconcile_optimistic(temp_id, record.key, record.created_at);
                continue;
            }
            let is_mine = record.sender_id == self_id;
            self.push_back(Message::from_record(record, is_mine));
            inserted += 1;
        }
        if inserted > 0 {
            let slots = &self.slots;
            self.order.sort_by_key(|&slot| {
                slots[slot]
                    .as_ref()
                    .map(Message::sort_token)
                    .unwrap_or((DateTime::<Utc>::MIN_UTC, 0))
            });
        }
        inserted
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        let slot = self.by_id.get(&id)?;
        self.slots[*slot].as_ref()
    }

    pub fn get_local(&self, temp_id: TempId) -> Option<&Message> {
        let slot = self.by_temp.get(&temp_id)?;
        self.slots[*slot].as_ref()
    }

    /// Messages oldest-first, as the viewport renders them.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.order
            .iter()
            .filter_map(|&slot| self.slots[slot].as_ref())
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn sorted_batch(mut records: Vec<MessageRecord>) -> Vec<MessageRecord> {
        records.sort_by_key(|record| (record.created_at, record.key.sort_key));
        records.dedup_by_key(|record| record.key.id);
        records
    }

    fn confirmed_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_mut()
    }

    fn alloc(&mut self, message: Message) -> usize {
        let slot = self.slots.len();
        match message.identity {
            MessageIdentity::Confirmed(key) => {
                self.by_id.insert(key.id, slot);
            }
            MessageIdentity::Local(temp_id) => {
                self.by_temp.insert(temp_id, slot);
            }
        }
        self.slots.push(Some(message));
        slot
    }

    fn push_back(&mut self, message: Message) {
        let slot = self.alloc(message);
        self.order.push(slot);
    }

    fn release(&mut self, slot: usize) {
        if let Some(message) = self.slots[slot].take() {
            match message.identity {
                MessageIdentity::Confirmed(key) => {
                    self.by_id.remove(&key.id);
                }
                MessageIdentity::Local(temp_id) => {
                    self.by_temp.remove(&temp_id);
                }
            }
        }
        self.order.retain(|&index| index != slot);
    }
}
