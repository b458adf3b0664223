use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde::Deserialize;
use shared::domain::UserId;

use crate::error::EngineError;

/// Immutable per-session identity, derived once from the opaque credential at
/// construction and never mutated afterwards. The engine only needs it to
/// tell "mine" from "theirs" for status and acknowledgment logic, so the
/// credential's signature is not verified here — the backend does that on
/// every request.
#[derive(Debug, Clone)]
pub struct SessionContext {
    user_id: UserId,
    credential: String,
}

#[derive(Deserialize)]
struct CredentialClaims {
    sub: i64,
}

impl SessionContext {
    /// Decode a JWT-shaped credential into the session's user identity.
    pub fn from_credential(credential: &str) -> Result<Self, EngineError> {
        let payload = credential.split('.').nth(1).ok_or_else(|| {
            EngineError::Credential("credential is not a three-part token".to_string())
        })?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload.as_bytes())
            .map_err(|err| EngineError::Credential(format!("payload is not base64url: {err}")))?;
        let claims: CredentialClaims = serde_json::from_slice(&decoded).map_err(|err| {
            EngineError::Credential(format!("payload is not a claims object: {err}"))
        })?;

        Ok(Self {
            user_id: UserId(claims.sub),
            credential: credential.to_string(),
        })
    }

    /// Construct a session for an already-known user id. Used by tests and by
    /// callers that resolve identity out of band.
    pub fn for_user(user_id: UserId, credential: impl Into<String>) -> Self {
        Self {
            user_id,
            credential: credential.into(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn is_self(&self, sender: UserId) -> bool {
        self.user_id == sender
    }
}
