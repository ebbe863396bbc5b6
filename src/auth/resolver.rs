use chrono::Utc;
use thiserror::Error;

use super::{ApiKeyGenerator, Principal, SessionSigner};
use crate::store::StoreHandle;

const BEARER_SCHEME: &str = "Bearer";
const API_KEY_SCHEME: &str = "ApiKey";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("authorization header required")]
    MissingCredential,

    #[error("malformed authorization header")]
    MalformedCredential,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("unsupported authorization scheme")]
    UnsupportedCredentialType,

    #[error(transparent)]
    Internal(#[from] crate::error::Error),
}

/// Turns an `Authorization` header value into a [`Principal`].
#[derive(Clone)]
pub struct CredentialResolver {
    store: StoreHandle,
    signer: SessionSigner,
    keys: ApiKeyGenerator,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(store: StoreHandle, signer: SessionSigner) -> Self {
        Self {
            store,
            signer,
            keys: ApiKeyGenerator::new(),
        }
    }

    pub async fn resolve(&self, header: Option<&str>) -> Result<Principal, CredentialError> {
        let header = match header {
            Some(h) if !h.is_empty() => h,
            _ => return Err(CredentialError::MissingCredential),
        };

        let (scheme, value) = header
            .split_once(' ')
            .ok_or(CredentialError::MalformedCredential)?;

        match scheme {
            BEARER_SCHEME => self.resolve_session(value),
            API_KEY_SCHEME => self.resolve_api_key(value).await,
            _ => Err(CredentialError::UnsupportedCredentialType),
        }
    }

    fn resolve_session(&self, token: &str) -> Result<Principal, CredentialError> {
        let claims = self.signer.verify(token).map_err(|e| {
            tracing::debug!("session token rejected: {e}");
            CredentialError::InvalidCredential
        })?;

        Ok(Principal {
            user_id: claims.user_id,
            email: claims.email,
        })
    }

    async fn resolve_api_key(&self, raw: &str) -> Result<Principal, CredentialError> {
        let digest = self.keys.digest(raw);
        let owner = self
            .store
            .run(move |store| store.find_user_by_credential_digest(&digest))
            .await?
            .ok_or(CredentialError::InvalidCredential)?;

        if owner.credential.is_expired_at(Utc::now()) {
            tracing::debug!(
                "api key {} (prefix {}) used after expiry",
                owner.credential.id,
                owner.credential.key_prefix
            );
            return Err(CredentialError::InvalidCredential);
        }

        self.record_usage(owner.credential.id);

        Ok(Principal {
            user_id: owner.user.id,
            email: owner.user.email,
        })
    }

    /// Detached `last_used_at` update. Bounded by the store timeout; failures
    /// are logged and never reach the request.
    fn record_usage(&self, credential_id: i64) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .run(move |store| store.touch_credential(credential_id))
                .await
            {
                tracing::warn!("Failed to update api key last_used_at: {e}");
            }
        });
    }
}
