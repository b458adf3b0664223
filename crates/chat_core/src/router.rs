//! Push-channel event routing: decode inbound frames and fold each event into
//! the registry and timelines, emitting acknowledgment frames back out.

use shared::domain::DeliveryStatus;
use shared::protocol::{AckAction, AckFrame, PushFrame, ServerEvent};
use tracing::{debug, warn};

use crate::registry::TouchUpdate;
use crate::{ChatClient, ClientEvent};

const KNOWN_TAGS: &[&str] = &[
    "new_message",
    "message_delivered",
    "message_read",
    "message_edited",
    "message_deleted",
    "reaction_updated",
    "conversation_updated",
    "send_acknowledged",
];

/// Decode one inbound text frame. Unknown tags are ignored with a log line so
/// an older client survives newer servers; a malformed payload for a known
/// tag is dropped the same way rather than poisoning the stream.
pub fn decode_frame(text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => Some(event),
        Err(err) => {
            match serde_json::from_str::<PushFrame>(text) {
                Ok(frame) if KNOWN_TAGS.contains(&frame.kind.as_str()) => {
                    warn!(tag = %frame.kind, error = %err, "malformed push frame dropped");
                }
                Ok(frame) => {
                    debug!(tag = %frame.kind, "unrecognized push event tag ignored");
                }
                Err(_) => {
                    warn!(error = %err, "undecodable push frame dropped");
                }
            }
            None
        }
    }
}

impl ChatClient {
    /// Apply one decoded push event. The whole read-modify-write happens
    /// under the state lock; acks and consumer notifications are sent after
    /// it is released.
    pub(crate) async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => {
                let conversation_id = message.conversation_id.clone();
                let is_mine = self.session.is_self(message.sender_id);

                let mut state = self.inner.lock().await;
                if !state.registry.contains(&conversation_id) {
                    // A page that would introduce this conversation has not
                    // been fetched yet; the message will arrive with it.
                    debug!(
                        conversation_id = %conversation_id.0,
                        "message for unknown conversation dropped"
                    );
                    return;
                }
                let is_active = state.active_conversation.as_ref() == Some(&conversation_id);

                let mut viewport = None;
                if is_active {
                    let timeline = state.timelines.entry(conversation_id.clone()).or_default();
                    if let Some(temp_id) = timeline.match_unconfirmed(&message) {
                        // Echo of an optimistic send that beat the response.
                        timeline.reconcile_optimistic(temp_id, message.key, message.created_at);
                    } else if let Some(instruction) =
                        timeline.append_live(message.clone(), is_mine)
                    {
                        viewport = Some(instruction);
                    }
                }

                state.registry.touch(
                    &conversation_id,
                    TouchUpdate {
                        preview: Some(message.content.preview()),
                        timestamp: message.created_at,
                        status: is_mine.then_some(DeliveryStatus::Sent),
                        unread_delta: u32::from(!is_active && !is_mine),
                    },
                );
                let conversations = state.registry.snapshot();

                let ack = (!is_mine).then(|| AckFrame {
                    action: if is_active {
                        AckAction::AckRead
                    } else {
                        AckAction::AckDelivered
                    },
                    conversation_id: conversation_id.clone(),
                    message_ids: vec![message.key.id],
                });
                let ack_tx = state.ack_tx.clone();
                drop(state);

                if let (Some(frame), Some(tx)) = (ack, ack_tx) {
                    if tx.send(frame).is_err() {
                        warn!("push channel writer gone, acknowledgment dropped");
                    }
                }
                if is_active {
                    let _ = self.events.send(ClientEvent::TimelineUpdated {
                        conversation_id: conversation_id.clone(),
                        viewport,
                    });
                }
                let _ = self
                    .events
                    .send(ClientEvent::ConversationsUpdated(conversations));
            }

            ServerEvent::MessageDelivered {
                conversation_id,
                message_ids,
            } => {
                self.advance_statuses(conversation_id, &message_ids, DeliveryStatus::Delivered)
                    .await;
            }
            ServerEvent::MessageRead {
                conversation_id,
                message_ids,
            } => {
                self.advance_statuses(conversation_id, &message_ids, DeliveryStatus::Read)
                    .await;
            }

            ServerEvent::MessageEdited {
                conversation_id,
                key,
                content,
            } => {
                let mut state = self.inner.lock().await;
                let changed = state
                    .timelines
                    .get_mut(&conversation_id)
                    .is_some_and(|timeline| timeline.apply_edit(key, content));
                drop(state);
                if changed {
                    let _ = self.events.send(ClientEvent::TimelineUpdated {
                        conversation_id,
                        viewport: None,
                    });
                }
            }

            ServerEvent::MessageDeleted {
                conversation_id,
                key,
            } => {
                let mut state = self.inner.lock().await;
                let changed = state
                    .timelines
                    .get_mut(&conversation_id)
                    .is_some_and(|timeline| timeline.apply_delete(key));
                drop(state);
                if changed {
                    let _ = self.events.send(ClientEvent::TimelineUpdated {
                        conversation_id,
                        viewport: None,
                    });
                }
            }

            ServerEvent::ReactionUpdated {
                conversation_id,
                key,
                reactions,
            } => {
                let mut state = self.inner.lock().await;
                let changed = state
                    .timelines
                    .get_mut(&conversation_id)
                    .is_some_and(|timeline| timeline.apply_reactions(key, reactions));
                drop(state);
                if changed {
                    let _ = self.events.send(ClientEvent::TimelineUpdated {
                        conversation_id,
                        viewport: None,
                    });
                }
            }

            ServerEvent::ConversationUpdated {
                conversation_id,
                preview,
                last_message_at,
                last_message_status,
                unread_increment,
                typing,
                online,
            } => {
                let mut state = self.inner.lock().await;
                let is_active = state.active_conversation.as_ref() == Some(&conversation_id);
                let mut changed = false;
                // Activity reorders the list; presence and typing alone only
                // patch the existing row in place.
                if let Some(timestamp) = last_message_at {
                    changed |= state.registry.touch(
                        &conversation_id,
                        TouchUpdate {
                            preview,
                            timestamp,
                            status: last_message_status,
                            unread_delta: if is_active { 0 } else { unread_increment },
                        },
                    );
                }
                if let Some(typing) = typing {
                    changed |= state.registry.set_typing(&conversation_id, typing);
                }
                if let Some(online) = online {
                    changed |= state.registry.set_online(&conversation_id, online);
                }
                let conversations = changed.then(|| state.registry.snapshot());
                drop(state);
                if let Some(conversations) = conversations {
                    let _ = self
                        .events
                        .send(ClientEvent::ConversationsUpdated(conversations));
                }
            }

            ServerEvent::SendAcknowledged {
                conversation_id,
                message_id,
            } => {
                debug!(
                    conversation_id = %conversation_id.0,
                    message_id = message_id.0,
                    "send acknowledged"
                );
            }
        }
    }

    async fn advance_statuses(
        &self,
        conversation_id: shared::domain::ConversationId,
        message_ids: &[shared::domain::MessageId],
        status: DeliveryStatus,
    ) {
        let mut state = self.inner.lock().await;
        let changed = state
            .timelines
            .get_mut(&conversation_id)
            .is_some_and(|timeline| timeline.advance_status(message_ids, status));
        drop(state);
        if changed {
            let _ = self.events.send(ClientEvent::TimelineUpdated {
                conversation_id,
                viewport: None,
            });
        }
    }
}
