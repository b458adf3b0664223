use super::*;

use std::collections::VecDeque;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use shared::domain::{Cursor, LinkPreview};
use shared::error::{ApiError, ApiException, ErrorCode};
use shared::protocol::{
    AckAction, AckFrame, ConversationPage, ConversationSnapshot, MessagePage, MessageRecord,
    ReactionMap, SendMessageRequest, SendMessageResponse, ServerEvent,
};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Notify},
};

const ME: UserId = UserId(1);
const PEER: UserId = UserId(2);

fn conv(peer: i64) -> ConversationId {
    ConversationId(format!("conv-{peer}"))
}

fn snapshot(peer: i64) -> ConversationSnapshot {
    ConversationSnapshot {
        conversation_id: conv(peer),
        peer_id: UserId(peer),
        display_name: format!("peer {peer}"),
        avatar_url: None,
        last_message_preview: None,
        last_message_at: None,
        online: true,
        unread_count: 0,
        last_message_status: None,
    }
}

fn record(id: i64, conversation: &ConversationId, sender: UserId, body: &str) -> MessageRecord {
    MessageRecord {
        key: MessageKey {
            sort_key: id * 10,
            id: MessageId(id),
        },
        conversation_id: conversation.clone(),
        sender_id: sender,
        content: MessageContent::text(body),
        created_at: Utc::now(),
        reply_to: None,
        reactions: ReactionMap::new(),
        read_at: None,
    }
}

#[derive(Default)]
struct MockApi {
    conversation_pages: Mutex<VecDeque<ConversationPage>>,
    message_pages: Mutex<VecDeque<MessagePage>>,
    message_gate: Mutex<Option<Arc<Notify>>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    provision_fails: bool,
    send_fails: bool,
    sent: Mutex<Vec<(ConversationId, MessageContent)>>,
}

impl MockApi {
    fn with_conversations(peers: &[i64]) -> Self {
        let page = ConversationPage {
            items: peers.iter().copied().map(snapshot).collect(),
            next_cursor: None,
        };
        let api = Self::default();
        api.conversation_pages.try_lock().unwrap().push_back(page);
        api
    }

    async fn queue_messages(&self, items: Vec<MessageRecord>, next_cursor: Option<Cursor>) {
        self.message_pages
            .lock()
            .await
            .push_back(MessagePage { items, next_cursor });
    }

    async fn gate_next_message_fetch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.message_gate.lock().await = Some(Arc::clone(&gate));
        gate
    }

    async fn gate_next_send(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().await = Some(Arc::clone(&gate));
        gate
    }
}

#[async_trait]
impl ConversationApi for MockApi {
    async fn list_conversations(&self, _cursor: Option<Cursor>) -> Result<ConversationPage> {
        Ok(self
            .conversation_pages
            .lock()
            .await
            .pop_front()
            .unwrap_or(ConversationPage {
                items: Vec::new(),
                next_cursor: None,
            }))
    }

    async fn list_messages(
        &self,
        _conversation_id: &ConversationId,
        _cursor: Option<Cursor>,
    ) -> Result<MessagePage> {
        let gate = self.message_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self
            .message_pages
            .lock()
            .await
            .pop_front()
            .unwrap_or(MessagePage {
                items: Vec::new(),
                next_cursor: None,
            }))
    }

    async fn create_or_get_conversation(&self, peer_id: UserId) -> Result<ConversationId> {
        if self.provision_fails {
            return Err(anyhow!("provisioning refused"));
        }
        Ok(conv(peer_id.0))
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: MessageContent,
        _reply_to: Option<MessageKey>,
    ) -> Result<SendMessageResponse> {
        let gate = self.send_gate.lock().await.take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.send_fails {
            return Err(anyhow!("send refused"));
        }
        self.sent
            .lock()
            .await
            .push((conversation_id.clone(), content));
        Ok(SendMessageResponse {
            message_id: MessageId(901),
            sort_key: 9010,
            created_at: Utc::now(),
        })
    }

    async fn edit_message(
        &self,
        _conversation_id: &ConversationId,
        _message_id: MessageId,
        _content: MessageContent,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_message(
        &self,
        _conversation_id: &ConversationId,
        _message_id: MessageId,
    ) -> Result<()> {
        Ok(())
    }

    async fn react_to_message(
        &self,
        _conversation_id: &ConversationId,
        _message_id: MessageId,
        _emoji: String,
        _add: bool,
    ) -> Result<()> {
        Ok(())
    }
}

struct FixedPreviewer;

#[async_trait]
impl LinkPreviewer for FixedPreviewer {
    async fn fetch_preview(&self, _url: &str) -> Result<LinkPreview> {
        Ok(LinkPreview {
            title: Some("Example".into()),
            description: None,
            image_url: None,
        })
    }
}

fn engine(api: Arc<MockApi>) -> Arc<ChatClient> {
    ChatClient::new(
        api,
        Arc::new(MissingLinkPreviewer),
        SessionContext::for_user(ME, "token"),
    )
}

async fn attach_ack_channel(client: &ChatClient) -> mpsc::UnboundedReceiver<AckFrame> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.inner.lock().await.ack_tx = Some(tx);
    rx
}

macro_rules! wait_until {
    ($cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..200 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(satisfied, "condition not reached in time");
    }};
}

#[tokio::test]
async fn optimistic_send_reconciles_to_single_sent_message() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();

    let key = client
        .send_message(PEER, MessageContent::text("hi"), None)
        .await
        .unwrap();
    assert_eq!(key.id, MessageId(901));

    let timeline = client.timeline(&conv(2)).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].identity, MessageIdentity::Confirmed(key));
    assert_eq!(timeline[0].status, DeliveryStatus::Sent);

    let conversations = client.conversations().await;
    assert_eq!(conversations[0].conversation_id, conv(2));
    assert_eq!(conversations[0].last_message_preview.as_deref(), Some("hi"));
    assert_eq!(
        conversations[0].last_message_status,
        Some(DeliveryStatus::Sent)
    );
}

#[tokio::test]
async fn failed_send_is_terminal_and_never_retried() {
    let mut api = MockApi::with_conversations(&[2]);
    api.send_fails = true;
    let api = Arc::new(api);
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();

    let result = client
        .send_message(PEER, MessageContent::text("hi"), None)
        .await;
    assert!(matches!(result, Err(EngineError::Send(_))));

    let timeline = client.timeline(&conv(2)).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].status, DeliveryStatus::Failed);
    assert!(matches!(timeline[0].identity, MessageIdentity::Local(_)));
    assert!(api.sent.lock().await.is_empty());
    assert_eq!(
        client.conversations().await[0].last_message_status,
        Some(DeliveryStatus::Failed)
    );
}

#[tokio::test]
async fn provisioning_failure_leaves_no_optimistic_artifact() {
    let mut api = MockApi::default();
    api.provision_fails = true;
    let client = engine(Arc::new(api));

    let result = client
        .send_message(UserId(9), MessageContent::text("hi"), None)
        .await;
    assert!(matches!(result, Err(EngineError::Provisioning { .. })));

    assert!(client.conversations().await.is_empty());
    assert!(client.timeline(&conv(9)).await.is_empty());
}

#[tokio::test]
async fn message_in_active_conversation_acks_read_exactly_once() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();
    client.open_conversation(conv(2)).await.unwrap();
    let mut acks = attach_ack_channel(&client).await;

    client
        .handle_server_event(ServerEvent::NewMessage {
            message: record(40, &conv(2), PEER, "hey"),
        })
        .await;

    let frame = acks.try_recv().unwrap();
    assert_eq!(frame.action, AckAction::AckRead);
    assert_eq!(frame.message_ids, vec![MessageId(40)]);
    assert!(acks.try_recv().is_err());

    assert_eq!(client.timeline(&conv(2)).await.len(), 1);
    assert_eq!(client.conversations().await[0].unread_count, 0);
}

#[tokio::test]
async fn message_in_background_conversation_acks_delivered() {
    let api = Arc::new(MockApi::with_conversations(&[2, 3]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();
    client.open_conversation(conv(3)).await.unwrap();
    let mut acks = attach_ack_channel(&client).await;

    client
        .handle_server_event(ServerEvent::NewMessage {
            message: record(41, &conv(2), PEER, "psst"),
        })
        .await;

    let frame = acks.try_recv().unwrap();
    assert_eq!(frame.action, AckAction::AckDelivered);
    assert!(acks.try_recv().is_err());

    // Background conversations get no timeline append, only list updates.
    assert!(client.timeline(&conv(2)).await.is_empty());
    let conversations = client.conversations().await;
    assert_eq!(conversations[0].conversation_id, conv(2));
    assert_eq!(conversations[0].unread_count, 1);
}

#[tokio::test]
async fn own_echo_is_never_acknowledged() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();
    client.open_conversation(conv(2)).await.unwrap();
    let mut acks = attach_ack_channel(&client).await;

    client
        .handle_server_event(ServerEvent::NewMessage {
            message: record(42, &conv(2), ME, "from my other device"),
        })
        .await;

    assert!(acks.try_recv().is_err());
    assert_eq!(client.conversations().await[0].unread_count, 0);
    assert_eq!(client.timeline(&conv(2)).await.len(), 1);
}

#[tokio::test]
async fn message_for_unknown_conversation_is_dropped_whole() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();
    let mut acks = attach_ack_channel(&client).await;

    client
        .handle_server_event(ServerEvent::NewMessage {
            message: record(43, &conv(77), UserId(77), "who dis"),
        })
        .await;

    assert!(acks.try_recv().is_err());
    assert_eq!(client.conversations().await.len(), 1);
    assert!(client.timeline(&conv(77)).await.is_empty());
}

#[tokio::test]
async fn echo_racing_the_send_response_yields_one_message() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();
    client.open_conversation(conv(2)).await.unwrap();

    let gate = api.gate_next_send().await;
    let sender = Arc::clone(&client);
    let send_task = tokio::spawn(async move {
        sender
            .send_message(PEER, MessageContent::text("racy"), None)
            .await
    });

    // Wait for the optimistic insert, then deliver the push echo while the
    // send response is still held back.
    wait_until!(client.timeline(&conv(2)).await.len() == 1);
    client
        .handle_server_event(ServerEvent::NewMessage {
            message: record(901, &conv(2), ME, "racy"),
        })
        .await;
    gate.notify_one();

    let key = send_task.await.unwrap().unwrap();
    assert_eq!(key.id, MessageId(901));

    let timeline = client.timeline(&conv(2)).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].message_id(), Some(MessageId(901)));
}

#[tokio::test]
async fn older_page_arriving_after_a_switch_is_discarded() {
    let api = Arc::new(MockApi::with_conversations(&[2, 3]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();

    api.queue_messages(
        vec![record(10, &conv(2), PEER, "newest in a")],
        Some(Cursor("older-a".into())),
    )
    .await;
    client.open_conversation(conv(2)).await.unwrap();

    let gate = api.gate_next_message_fetch().await;
    let loader = Arc::clone(&client);
    let older_task = tokio::spawn(async move { loader.load_older_messages().await });
    wait_until!(client
        .inner
        .lock()
        .await
        .cursors
        .in_flight(&cursor::ListKey::OlderMessages(conv(2))));

    api.queue_messages(vec![record(20, &conv(3), UserId(3), "b")], None)
        .await;
    client.open_conversation(conv(3)).await.unwrap();

    api.queue_messages(vec![record(9, &conv(2), PEER, "stale older page")], None)
        .await;
    gate.notify_one();
    older_task.await.unwrap().unwrap();

    let timeline_a = client.timeline(&conv(2)).await;
    assert_eq!(timeline_a.len(), 1);
    assert_eq!(timeline_a[0].message_id(), Some(MessageId(10)));
    assert_eq!(client.active_conversation().await, Some(conv(3)));
}

#[tokio::test]
async fn reconnect_reconciliation_backfills_missed_messages() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();

    api.queue_messages(vec![record(1, &conv(2), PEER, "a")], None)
        .await;
    client.open_conversation(conv(2)).await.unwrap();

    api.queue_messages(
        vec![
            record(1, &conv(2), PEER, "a"),
            record(2, &conv(2), PEER, "missed"),
            record(3, &conv(2), ME, "also missed"),
        ],
        None,
    )
    .await;
    client.reconcile_after_reconnect().await;

    let ids: Vec<_> = client
        .timeline(&conv(2))
        .await
        .iter()
        .filter_map(Message::message_id)
        .collect();
    assert_eq!(ids, vec![MessageId(1), MessageId(2), MessageId(3)]);
}

#[tokio::test]
async fn link_preview_enriches_message_after_send() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = ChatClient::new(
        Arc::clone(&api) as Arc<dyn ConversationApi>,
        Arc::new(FixedPreviewer),
        SessionContext::for_user(ME, "token"),
    );
    client.refresh_conversations().await.unwrap();

    client
        .send_message(PEER, MessageContent::text("look https://example.com/x"), None)
        .await
        .unwrap();

    wait_until!(client
        .timeline(&conv(2))
        .await
        .first()
        .is_some_and(|message| message.link_preview.is_some()));

    let timeline = client.timeline(&conv(2)).await;
    assert_eq!(
        timeline[0].link_preview.as_ref().and_then(|p| p.title.as_deref()),
        Some("Example")
    );
}

#[tokio::test]
async fn preview_failure_leaves_message_without_preview() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();

    client
        .send_message(PEER, MessageContent::text("see https://example.com/y"), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let timeline = client.timeline(&conv(2)).await;
    assert_eq!(timeline.len(), 1);
    assert_eq!(timeline[0].status, DeliveryStatus::Sent);
    assert!(timeline[0].link_preview.is_none());
}

#[tokio::test]
async fn duplicate_page_load_triggers_are_coalesced() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(Arc::clone(&api));
    client.refresh_conversations().await.unwrap();

    api.queue_messages(
        vec![record(5, &conv(2), PEER, "e")],
        Some(Cursor("older".into())),
    )
    .await;
    client.open_conversation(conv(2)).await.unwrap();

    let gate = api.gate_next_message_fetch().await;
    let loader = Arc::clone(&client);
    let first = tokio::spawn(async move { loader.load_older_messages().await });
    wait_until!(client
        .inner
        .lock()
        .await
        .cursors
        .in_flight(&cursor::ListKey::OlderMessages(conv(2))));

    // Second trigger while the first is in flight must be ignored, not queued.
    api.queue_messages(vec![record(4, &conv(2), PEER, "d")], None)
        .await;
    client.load_older_messages().await.unwrap();

    api.queue_messages(vec![record(3, &conv(2), PEER, "c")], None)
        .await;
    gate.notify_one();
    first.await.unwrap().unwrap();

    let ids: Vec<_> = client
        .timeline(&conv(2))
        .await
        .iter()
        .filter_map(Message::message_id)
        .collect();
    assert_eq!(ids, vec![MessageId(4), MessageId(5)]);
}

#[tokio::test]
async fn conversation_activity_update_reorders_and_increments_unread() {
    let api = Arc::new(MockApi::with_conversations(&[2, 3]));
    let client = engine(api);
    client.refresh_conversations().await.unwrap();

    client
        .handle_server_event(ServerEvent::ConversationUpdated {
            conversation_id: conv(3),
            preview: Some("fresh".into()),
            last_message_at: Some(Utc::now()),
            last_message_status: Some(DeliveryStatus::Delivered),
            unread_increment: 2,
            typing: None,
            online: None,
        })
        .await;

    let conversations = client.conversations().await;
    assert_eq!(conversations[0].conversation_id, conv(3));
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(
        conversations[0].last_message_preview.as_deref(),
        Some("fresh")
    );
    assert_eq!(
        conversations[0].last_message_status,
        Some(DeliveryStatus::Delivered)
    );
}

#[tokio::test]
async fn presence_only_update_patches_row_without_reordering() {
    let api = Arc::new(MockApi::with_conversations(&[2, 3]));
    let client = engine(api);
    client.refresh_conversations().await.unwrap();

    client
        .handle_server_event(ServerEvent::ConversationUpdated {
            conversation_id: conv(3),
            preview: None,
            last_message_at: None,
            last_message_status: None,
            unread_increment: 0,
            typing: Some(true),
            online: Some(false),
        })
        .await;

    let conversations = client.conversations().await;
    // No activity timestamp, so the second row stays second.
    assert_eq!(conversations[0].conversation_id, conv(2));
    assert_eq!(conversations[1].conversation_id, conv(3));
    assert!(conversations[1].typing);
    assert!(!conversations[1].online);
    assert_eq!(conversations[1].unread_count, 0);
}

#[tokio::test]
async fn conversation_update_for_unknown_conversation_is_dropped() {
    let api = Arc::new(MockApi::with_conversations(&[2]));
    let client = engine(api);
    client.refresh_conversations().await.unwrap();

    client
        .handle_server_event(ServerEvent::ConversationUpdated {
            conversation_id: conv(77),
            preview: Some("ghost".into()),
            last_message_at: Some(Utc::now()),
            last_message_status: None,
            unread_increment: 1,
            typing: Some(true),
            online: Some(true),
        })
        .await;

    let conversations = client.conversations().await;
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].conversation_id, conv(2));
}

// ---- HTTP collaborator round trip ------------------------------------------

#[derive(Clone)]
struct SendCapture {
    tx: Arc<Mutex<Option<oneshot::Sender<SendMessageRequest>>>>,
}

async fn handle_list_conversations() -> Json<ConversationPage> {
    Json(ConversationPage {
        items: vec![snapshot(2)],
        next_cursor: None,
    })
}

async fn handle_send_message(
    State(state): State<SendCapture>,
    Path(_conversation_id): Path<String>,
    Json(request): Json<SendMessageRequest>,
) -> Json<SendMessageResponse> {
    if let Some(tx) = state.tx.lock().await.take() {
        let _ = tx.send(request);
    }
    Json(SendMessageResponse {
        message_id: MessageId(7),
        sort_key: 70,
        created_at: Utc::now(),
    })
}

async fn handle_forbidden_delete(
    Path((_conversation_id, _message_id)): Path<(String, i64)>,
) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::FORBIDDEN,
        Json(ApiError::new(ErrorCode::Forbidden, "not your message")),
    )
}

async fn spawn_backend() -> Result<(String, oneshot::Receiver<SendMessageRequest>)> {
    let (tx, rx) = oneshot::channel();
    let state = SendCapture {
        tx: Arc::new(Mutex::new(Some(tx))),
    };
    let app = Router::new()
        .route("/conversations", get(handle_list_conversations))
        .route("/conversations/:id/messages", post(handle_send_message))
        .route(
            "/conversations/:id/messages/:message_id",
            delete(handle_forbidden_delete),
        )
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), rx))
}

#[tokio::test]
async fn http_api_round_trips_requests() {
    let (base_url, captured) = spawn_backend().await.unwrap();
    let api = HttpApi::new(base_url, "credential").unwrap();

    let page = api.list_conversations(None).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].peer_id, PEER);

    let response = api
        .send_message(&conv(2), MessageContent::text("hello"), None)
        .await
        .unwrap();
    assert_eq!(response.message_id, MessageId(7));

    let request = captured.await.unwrap();
    assert_eq!(request.content, MessageContent::text("hello"));
}

#[tokio::test]
async fn http_api_surfaces_server_error_envelopes() {
    let (base_url, _captured) = spawn_backend().await.unwrap();
    let api = HttpApi::new(base_url, "credential").unwrap();

    let err = api.delete_message(&conv(2), MessageId(5)).await.unwrap_err();
    let exception = err
        .downcast_ref::<ApiException>()
        .expect("typed error envelope");
    assert_eq!(exception.code, ErrorCode::Forbidden);
    assert_eq!(exception.message, "not your message");
}
