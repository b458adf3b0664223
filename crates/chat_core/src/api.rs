use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use shared::domain::{
    ConversationId, Cursor, LinkPreview, MessageContent, MessageId, MessageKey, UserId,
};
use shared::error::{ApiError, ApiException};
use shared::protocol::{
    ConversationPage, EditMessageRequest, LinkPreviewResponse, MessagePage,
    ProvisionConversationRequest, ProvisionConversationResponse, ReactRequest, SendMessageRequest,
    SendMessageResponse,
};
use tracing::debug;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Turn a non-2xx response into the server's typed error envelope when it
/// sent one, so callers can inspect `ApiException::code` instead of a bare
/// status line.
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(envelope) => Err(ApiException::new(envelope.code, envelope.message).into()),
        Err(_) => Err(anyhow!("request failed with status {status}")),
    }
}

/// Backend surface the engine talks to. Implemented over HTTP in production
/// and by in-memory fakes in tests.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self, cursor: Option<Cursor>) -> Result<ConversationPage>;

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<Cursor>,
    ) -> Result<MessagePage>;

    /// Resolve the conversation for a peer, creating it server-side if this
    /// is the first exchange.
    async fn create_or_get_conversation(&self, peer_id: UserId) -> Result<ConversationId>;

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: MessageContent,
        reply_to: Option<MessageKey>,
    ) -> Result<SendMessageResponse>;

    async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        content: MessageContent,
    ) -> Result<()>;

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
    ) -> Result<()>;

    async fn react_to_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        emoji: String,
        add: bool,
    ) -> Result<()>;
}

/// Fetches display metadata for a URL after a link message is confirmed.
#[async_trait]
pub trait LinkPreviewer: Send + Sync {
    async fn fetch_preview(&self, url: &str) -> Result<LinkPreview>;
}

/// Null collaborator for deployments without a preview service. Every lookup
/// reports failure and the message simply renders without a card.
pub struct MissingLinkPreviewer;

#[async_trait]
impl LinkPreviewer for MissingLinkPreviewer {
    async fn fetch_preview(&self, _url: &str) -> Result<LinkPreview> {
        Err(anyhow::anyhow!("no link preview service configured"))
    }
}

/// REST implementation of [`ConversationApi`].
pub struct HttpApi {
    http: Client,
    base_url: String,
    credential: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl ConversationApi for HttpApi {
    async fn list_conversations(&self, cursor: Option<Cursor>) -> Result<ConversationPage> {
        let mut request = self
            .http
            .get(self.url("/conversations"))
            .bearer_auth(&self.credential);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor.0)]);
        }
        let page = checked(request.send().await?).await?.json().await?;
        Ok(page)
    }

    async fn list_messages(
        &self,
        conversation_id: &ConversationId,
        cursor: Option<Cursor>,
    ) -> Result<MessagePage> {
        let mut request = self
            .http
            .get(self.url(&format!("/conversations/{}/messages", conversation_id.0)))
            .bearer_auth(&self.credential);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor.0)]);
        }
        let page = checked(request.send().await?).await?.json().await?;
        Ok(page)
    }

    async fn create_or_get_conversation(&self, peer_id: UserId) -> Result<ConversationId> {
        let response: ProvisionConversationResponse = checked(
            self.http
                .post(self.url("/conversations"))
                .bearer_auth(&self.credential)
                .json(&ProvisionConversationRequest { peer_id })
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        debug!(
            peer_id = peer_id.0,
            conversation_id = %response.conversation_id.0,
            "conversation provisioned"
        );
        Ok(response.conversation_id)
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: MessageContent,
        reply_to: Option<MessageKey>,
    ) -> Result<SendMessageResponse> {
        let response = checked(
            self.http
                .post(self.url(&format!("/conversations/{}/messages", conversation_id.0)))
                .bearer_auth(&self.credential)
                .json(&SendMessageRequest { content, reply_to })
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(response)
    }

    async fn edit_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        content: MessageContent,
    ) -> Result<()> {
        checked(
            self.http
                .patch(self.url(&format!(
                    "/conversations/{}/messages/{}",
                    conversation_id.0, message_id.0
                )))
                .bearer_auth(&self.credential)
                .json(&EditMessageRequest { content })
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
    ) -> Result<()> {
        checked(
            self.http
                .delete(self.url(&format!(
                    "/conversations/{}/messages/{}",
                    conversation_id.0, message_id.0
                )))
                .bearer_auth(&self.credential)
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn react_to_message(
        &self,
        conversation_id: &ConversationId,
        message_id: MessageId,
        emoji: String,
        add: bool,
    ) -> Result<()> {
        checked(
            self.http
                .post(self.url(&format!(
                    "/conversations/{}/messages/{}/reactions",
                    conversation_id.0, message_id.0
                )))
                .bearer_auth(&self.credential)
                .json(&ReactRequest { emoji, add })
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }
}

/// REST implementation of [`LinkPreviewer`] against the backend's
/// `/link-preview` endpoint.
pub struct HttpLinkPreviewer {
    http: Client,
    base_url: String,
    credential: String,
}

impl HttpLinkPreviewer {
    pub fn new(base_url: impl Into<String>, credential: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credential: credential.into(),
        })
    }
}

#[async_trait]
impl LinkPreviewer for HttpLinkPreviewer {
    async fn fetch_preview(&self, url: &str) -> Result<LinkPreview> {
        let response: LinkPreviewResponse = checked(
            self.http
                .get(format!("{}/link-preview", self.base_url))
                .bearer_auth(&self.credential)
                .query(&[("url", url)])
                .send()
                .await?,
        )
        .await?
        .json()
        .await?;
        Ok(response.preview)
    }
}
