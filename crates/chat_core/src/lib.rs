//! Client-side conversation and message synchronization engine.
//!
//! Merges three unsynchronized sources into one consistent view: paginated
//! REST snapshots, optimistic local sends, and live push events. All mutable
//! state lives behind a single mutex so every read-modify-write completes
//! before the next one starts, regardless of which source triggered it.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use shared::domain::{ConversationId, MessageContent, MessageId, MessageKey, TempId, UserId};
use shared::protocol::AckFrame;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};
use url::Url;

pub mod api;
pub mod cursor;
pub mod error;
pub mod registry;
pub mod router;
pub mod session;
pub mod timeline;
pub mod transport;

pub use api::{ConversationApi, HttpApi, HttpLinkPreviewer, LinkPreviewer, MissingLinkPreviewer};
pub use error::EngineError;
pub use registry::{ConversationRegistry, ConversationSummary, TouchUpdate};
pub use session::SessionContext;
pub use timeline::{Message, MessageIdentity, MessageTimeline, ViewportInstruction};

use cursor::{CursorStore, ListKey};
use shared::domain::DeliveryStatus;

/// Notifications pushed to the consumer (UI layer) whenever engine state
/// changes. Consumers re-render from the snapshots; they never mutate.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsUpdated(Vec<ConversationSummary>),
    TimelineUpdated {
        conversation_id: ConversationId,
        /// `None` for in-place changes (edits, reactions, status) that must
        /// not move the viewport.
        viewport: Option<ViewportInstruction>,
    },
    MessageFailed {
        conversation_id: ConversationId,
        temp_id: TempId,
    },
    LinkPreviewReady {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    Error(String),
}

pub(crate) struct EngineState {
    pub(crate) active_conversation: Option<ConversationId>,
    pub(crate) registry: ConversationRegistry,
    pub(crate) timelines: HashMap<ConversationId, MessageTimeline>,
    pub(crate) cursors: CursorStore,
    pub(crate) ack_tx: Option<mpsc::UnboundedSender<AckFrame>>,
    /// Bumped on every conversation switch; an in-flight fetch that started
    /// under an older epoch discards its response instead of merging it.
    pub(crate) timeline_epoch: u64,
}

pub struct ChatClient {
    pub(crate) api: Arc<dyn ConversationApi>,
    pub(crate) previewer: Arc<dyn LinkPreviewer>,
    pub(crate) session: SessionContext,
    pub(crate) inner: Mutex<EngineState>,
    pub(crate) events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(
        api: Arc<dyn ConversationApi>,
        previewer: Arc<dyn LinkPreviewer>,
        session: SessionContext,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            previewer,
            session,
            inner: Mutex::new(EngineState {
                active_conversation: None,
                registry: ConversationRegistry::default(),
                timelines: HashMap::new(),
                cursors: CursorStore::default(),
                ack_tx: None,
                timeline_epoch: 0,
            }),
            events,
        })
    }

    /// Wire up the production HTTP collaborators from a base URL and the
    /// session credential.
    pub fn with_http(base_url: &str, credential: &str) -> Result<Arc<Self>> {
        let session = SessionContext::from_credential(credential)?;
        let api = Arc::new(HttpApi::new(base_url, credential)?);
        let previewer = Arc::new(HttpLinkPreviewer::new(base_url, credential)?);
        Ok(Self::new(api, previewer, session))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn user_id(&self) -> UserId {
        self.session.user_id()
    }

    // ---- conversation list -------------------------------------------------

    /// Fetch the first page of the conversation list, replacing whatever is
    /// loaded.
    pub async fn refresh_conversations(&self) -> Result<()> {
        {
            let mut state = self.inner.lock().await;
            state.cursors.reset(&ListKey::Conversations);
        }
        self.fetch_conversations(true).await
    }

    /// Fetch the next page of the conversation list. A no-op while a fetch is
    /// already in flight or the list is exhausted.
    pub async fn load_more_conversations(&self) -> Result<()> {
        self.fetch_conversations(false).await
    }

    async fn fetch_conversations(&self, is_initial: bool) -> Result<()> {
        let cursor = {
            let mut state = self.inner.lock().await;
            match state.cursors.begin_fetch(ListKey::Conversations) {
                Some(cursor) => cursor,
                None => return Ok(()),
            }
        };

        match self.api.list_conversations(cursor).await {
            Ok(page) => {
                let snapshot = {
                    let mut state = self.inner.lock().await;
                    state
                        .cursors
                        .complete_fetch(&ListKey::Conversations, page.next_cursor);
                    let items = page.items.into_iter().map(Into::into).collect();
                    state.registry.load_page(items, is_initial);
                    state.registry.snapshot()
                };
                let _ = self.events.send(ClientEvent::ConversationsUpdated(snapshot));
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.lock().await;
                state.cursors.abort_fetch(&ListKey::Conversations);
                drop(state);
                warn!(error = %err, "conversation page fetch failed");
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    // ---- active conversation and message pages -----------------------------

    /// Make a conversation active: resets its pagination, loads the newest
    /// page of history, and clears its unread count. Any older-page fetch
    /// still in flight for the previously active conversation becomes stale
    /// and will be discarded on arrival.
    pub async fn open_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let key = ListKey::OlderMessages(conversation_id.clone());
        let (epoch, cursor) = {
            let mut state = self.inner.lock().await;
            state.active_conversation = Some(conversation_id.clone());
            state.timeline_epoch += 1;
            state.cursors.reset(&key);
            // A freshly reset list always grants the claim, with no cursor.
            let cursor = state.cursors.begin_fetch(key.clone()).flatten();
            (state.timeline_epoch, cursor)
        };

        match self.api.list_messages(&conversation_id, cursor).await {
            Ok(page) => {
                let stale = {
                    let mut state = self.inner.lock().await;
                    if state.timeline_epoch != epoch {
                        true
                    } else {
                        state.cursors.complete_fetch(&key, page.next_cursor);
                        let self_id = self.session.user_id();
                        let viewport = state
                            .timelines
                            .entry(conversation_id.clone())
                            .or_default()
                            .load_initial(page.items, self_id);
                        state.registry.mark_read(&conversation_id);
                        let conversations = state.registry.snapshot();
                        drop(state);
                        let _ = self.events.send(ClientEvent::TimelineUpdated {
                            conversation_id: conversation_id.clone(),
                            viewport: Some(viewport),
                        });
                        let _ = self
                            .events
                            .send(ClientEvent::ConversationsUpdated(conversations));
                        false
                    }
                };
                if stale {
                    debug!(conversation_id = %conversation_id.0, "stale initial page discarded");
                }
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.lock().await;
                if state.timeline_epoch == epoch {
                    state.cursors.abort_fetch(&key);
                }
                drop(state);
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn close_conversation(&self) {
        let mut state = self.inner.lock().await;
        state.active_conversation = None;
        state.timeline_epoch += 1;
    }

    /// Fetch the page before the oldest loaded message of the active
    /// conversation. Coalesces duplicate triggers and discards the response
    /// if the user has switched conversations meanwhile.
    pub async fn load_older_messages(&self) -> Result<()> {
        let (conversation_id, cursor, epoch) = {
            let mut state = self.inner.lock().await;
            let conversation_id = state
                .active_conversation
                .clone()
                .ok_or(EngineError::NoActiveConversation)?;
            let key = ListKey::OlderMessages(conversation_id.clone());
            match state.cursors.begin_fetch(key) {
                Some(cursor) => (conversation_id, cursor, state.timeline_epoch),
                None => return Ok(()),
            }
        };
        let key = ListKey::OlderMessages(conversation_id.clone());

        match self.api.list_messages(&conversation_id, cursor).await {
            Ok(page) => {
                let mut state = self.inner.lock().await;
                if state.timeline_epoch != epoch
                    || state.active_conversation.as_ref() != Some(&conversation_id)
                {
                    debug!(
                        conversation_id = %conversation_id.0,
                        "older page arrived after conversation switch, discarded"
                    );
                    return Ok(());
                }
                state.cursors.complete_fetch(&key, page.next_cursor);
                let self_id = self.session.user_id();
                let viewport = state
                    .timelines
                    .entry(conversation_id.clone())
                    .or_default()
                    .load_older(page.items, self_id);
                drop(state);
                let _ = self.events.send(ClientEvent::TimelineUpdated {
                    conversation_id,
                    viewport: Some(viewport),
                });
                Ok(())
            }
            Err(err) => {
                let mut state = self.inner.lock().await;
                if state.timeline_epoch == epoch {
                    state.cursors.abort_fetch(&key);
                }
                drop(state);
                let _ = self.events.send(ClientEvent::Error(err.to_string()));
                Err(err)
            }
        }
    }

    // ---- outbound sends ----------------------------------------------------

    /// Send a message to a peer, optimistically. The message appears in the
    /// timeline in `sending` status before any network round trip; on success
    /// it is reconciled in place with the server identity, on failure it is
    /// marked `failed` and stays put. Re-sending is a user decision, never
    /// automatic.
    pub async fn send_message(
        self: &Arc<Self>,
        peer_id: UserId,
        content: MessageContent,
        reply_to: Option<MessageKey>,
    ) -> Result<MessageKey, EngineError> {
        let conversation_id = self.resolve_conversation(peer_id).await?;

        let temp_id = TempId::generate();
        let created_at = Utc::now();
        {
            let mut state = self.inner.lock().await;
            state
                .timelines
                .entry(conversation_id.clone())
                .or_default()
                .insert_optimistic(Message::optimistic(
                    temp_id,
                    self.session.user_id(),
                    content.clone(),
                    created_at,
                    reply_to,
                ));
            state.registry.touch(
                &conversation_id,
                TouchUpdate {
                    preview: Some(content.preview()),
                    timestamp: created_at,
                    status: Some(DeliveryStatus::Sending),
                    unread_delta: 0,
                },
            );
            let conversations = state.registry.snapshot();
            drop(state);
            let _ = self.events.send(ClientEvent::TimelineUpdated {
                conversation_id: conversation_id.clone(),
                viewport: Some(ViewportInstruction::StickToBottom),
            });
            let _ = self
                .events
                .send(ClientEvent::ConversationsUpdated(conversations));
        }

        match self
            .api
            .send_message(&conversation_id, content.clone(), reply_to)
            .await
        {
            Ok(response) => {
                let key = MessageKey {
                    sort_key: response.sort_key,
                    id: response.message_id,
                };
                let mut state = self.inner.lock().await;
                if let Some(timeline) = state.timelines.get_mut(&conversation_id) {
                    timeline.reconcile_optimistic(temp_id, key, response.created_at);
                }
                state.registry.touch(
                    &conversation_id,
                    TouchUpdate {
                        preview: None,
                        timestamp: response.created_at,
                        status: Some(DeliveryStatus::Sent),
                        unread_delta: 0,
                    },
                );
                let conversations = state.registry.snapshot();
                drop(state);
                let _ = self.events.send(ClientEvent::TimelineUpdated {
                    conversation_id: conversation_id.clone(),
                    viewport: None,
                });
                let _ = self
                    .events
                    .send(ClientEvent::ConversationsUpdated(conversations));

                if let Some(link) = detect_link(&content) {
                    self.spawn_link_enrichment(conversation_id, key.id, link);
                }
                Ok(key)
            }
            Err(err) => {
                let mut state = self.inner.lock().await;
                if let Some(timeline) = state.timelines.get_mut(&conversation_id) {
                    timeline.fail(temp_id);
                }
                state.registry.touch(
                    &conversation_id,
                    TouchUpdate {
                        preview: None,
                        timestamp: created_at,
                        status: Some(DeliveryStatus::Failed),
                        unread_delta: 0,
                    },
                );
                let conversations = state.registry.snapshot();
                drop(state);
                warn!(conversation_id = %conversation_id.0, error = %err, "send failed");
                let _ = self.events.send(ClientEvent::MessageFailed {
                    conversation_id: conversation_id.clone(),
                    temp_id,
                });
                let _ = self.events.send(ClientEvent::TimelineUpdated {
                    conversation_id,
                    viewport: None,
                });
                let _ = self
                    .events
                    .send(ClientEvent::ConversationsUpdated(conversations));
                Err(EngineError::Send(err))
            }
        }
    }

    /// Resolve the conversation for a peer, provisioning one server-side on
    /// first contact. A provisioning failure aborts the send before any
    /// optimistic state is created.
    async fn resolve_conversation(&self, peer_id: UserId) -> Result<ConversationId, EngineError> {
        {
            let state = self.inner.lock().await;
            if let Some(conversation_id) = state.registry.conversation_of(peer_id) {
                return Ok(conversation_id);
            }
        }

        let conversation_id = self
            .api
            .create_or_get_conversation(peer_id)
            .await
            .map_err(|source| EngineError::Provisioning { peer_id, source })?;

        let mut state = self.inner.lock().await;
        if !state.registry.contains(&conversation_id) {
            state.registry.insert_front(ConversationSummary {
                conversation_id: conversation_id.clone(),
                peer_id,
                display_name: peer_id.0.to_string(),
                avatar_url: None,
                last_message_preview: None,
                last_message_at: None,
                online: false,
                unread_count: 0,
                last_message_status: None,
                typing: false,
            });
        }
        Ok(conversation_id)
    }

    fn spawn_link_enrichment(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        message_id: MessageId,
        url: String,
    ) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            match client.previewer.fetch_preview(&url).await {
                Ok(preview) => {
                    let mut state = client.inner.lock().await;
                    let attached = state
                        .timelines
                        .get_mut(&conversation_id)
                        .is_some_and(|timeline| timeline.attach_link_preview(message_id, preview));
                    drop(state);
                    if attached {
                        let _ = client.events.send(ClientEvent::LinkPreviewReady {
                            conversation_id: conversation_id.clone(),
                            message_id,
                        });
                        let _ = client.events.send(ClientEvent::TimelineUpdated {
                            conversation_id,
                            viewport: None,
                        });
                    }
                }
                Err(err) => {
                    debug!(url, error = %err, "link preview enrichment failed");
                }
            }
        });
    }

    // ---- message mutations -------------------------------------------------
    //
    // Edits, deletes and reactions are thin requests: the local state change
    // arrives through the corresponding push event, same as on other devices.

    pub async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        content: MessageContent,
    ) -> Result<(), EngineError> {
        self.api
            .edit_message(conversation_id, message_id, content)
            .await
            .map_err(EngineError::Mutation)
    }

    pub async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
    ) -> Result<(), EngineError> {
        self.api
            .delete_message(conversation_id, message_id)
            .await
            .map_err(EngineError::Mutation)
    }

    pub async fn react_to_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        emoji: String,
        add: bool,
    ) -> Result<(), EngineError> {
        self.api
            .react_to_message(conversation_id, message_id, emoji, add)
            .await
            .map_err(EngineError::Mutation)
    }

    pub async fn mark_conversation_read(&self, conversation_id: &ConversationId) {
        let mut state = self.inner.lock().await;
        if state.registry.mark_read(conversation_id) {
            let conversations = state.registry.snapshot();
            drop(state);
            let _ = self
                .events
                .send(ClientEvent::ConversationsUpdated(conversations));
        }
    }

    // ---- reconnect recovery ------------------------------------------------

    /// Events missed during a push-channel outage are gone (at-most-once
    /// transport), so after a reconnect the active conversation's newest page
    /// is re-fetched and folded in.
    pub(crate) async fn reconcile_after_reconnect(&self) {
        let (conversation_id, epoch) = {
            let state = self.inner.lock().await;
            match state.active_conversation.clone() {
                Some(conversation_id) => (conversation_id, state.timeline_epoch),
                None => return,
            }
        };

        match self.api.list_messages(&conversation_id, None).await {
            Ok(page) => {
                let mut state = self.inner.lock().await;
                if state.timeline_epoch != epoch {
                    return;
                }
                let self_id = self.session.user_id();
                let inserted = state
                    .timelines
                    .entry(conversation_id.clone())
                    .or_default()
                    .merge_latest(page.items, self_id);
                drop(state);
                if inserted > 0 {
                    debug!(
                        conversation_id = %conversation_id.0,
                        inserted, "reconnect reconciliation recovered messages"
                    );
                    let _ = self.events.send(ClientEvent::TimelineUpdated {
                        conversation_id,
                        viewport: Some(ViewportInstruction::StickToBottom),
                    });
                }
            }
            Err(err) => {
                warn!(error = %err, "reconnect reconciliation fetch failed");
            }
        }
    }

    // ---- read-only snapshots -----------------------------------------------

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.registry.snapshot()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.inner.lock().await.active_conversation.clone()
    }

    pub async fn timeline(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .timelines
            .get(conversation_id)
            .map(MessageTimeline::snapshot)
            .unwrap_or_default()
    }

    pub async fn has_more_messages(&self, conversation_id: &ConversationId) -> bool {
        self.inner
            .lock()
            .await
            .cursors
            .has_more(&ListKey::OlderMessages(conversation_id.clone()))
    }
}

/// Pick the first URL-shaped token out of a message, if any.
fn detect_link(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Link { url, .. } => Some(url.clone()),
        MessageContent::Text { body } => body
            .split_whitespace()
            .find(|token| {
                (token.starts_with("http://") || token.starts_with("https://"))
                    && Url::parse(token).is_ok()
            })
            .map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
