use shared::domain::UserId;
use thiserror::Error;

/// Failures the engine surfaces to callers. Everything here degrades to a
/// locally visible state (a failed send, a stale list); nothing is fatal.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid credential: {0}")]
    Credential(String),
    #[error("no active conversation")]
    NoActiveConversation,
    #[error("failed to provision conversation with peer {}: {source}", peer_id.0)]
    Provisioning {
        peer_id: UserId,
        #[source]
        source: anyhow::Error,
    },
    #[error("send failed: {0}")]
    Send(#[source] anyhow::Error),
    #[error("message mutation failed: {0}")]
    Mutation(#[source] anyhow::Error),
}
