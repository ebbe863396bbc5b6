//! TOTP second factor.
//!
//! State lives on the user row: `Disabled` (no secret), `PendingEnrollment`
//! (secret stored, not confirmed) and `Enabled` (confirmed, backup codes
//! issued). Only the hashes of backup codes are stored.

mod backup;

pub use backup::{BACKUP_CODE_COUNT, generate_backup_codes};

use serde::Serialize;
use thiserror::Error;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::auth::{Principal, SecretHasher};
use crate::error::Error as StoreError;
use crate::store::StoreHandle;
use crate::types::{TwoFactorPhase, TwoFactorState};

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;
const CONSUME_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum TwoFactorError {
    #[error("two-factor setup has not been started")]
    SetupNotInitiated,

    #[error("two-factor authentication is already enabled")]
    AlreadyEnabled,

    #[error("invalid verification code")]
    InvalidVerificationCode,

    #[error("incorrect password")]
    IncorrectPassword,

    #[error("user not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] StoreError),
}

/// Everything a client needs to register the secret with an authenticator.
#[derive(Debug, Clone, Serialize)]
pub struct Enrollment {
    pub secret: String,
    pub provisioning_uri: String,
    pub qr_code: String,
}

#[derive(Clone)]
pub struct TwoFactorManager {
    store: StoreHandle,
    hasher: SecretHasher,
    issuer: String,
}

impl TwoFactorManager {
    #[must_use]
    pub fn new(store: StoreHandle, hasher: SecretHasher, issuer: impl Into<String>) -> Self {
        Self {
            store,
            hasher,
            issuer: issuer.into(),
        }
    }

    /// Starts (or restarts) enrollment with a fresh 160-bit secret. A
    /// pending secret is replaced. An enabled factor is left untouched and
    /// must be disabled first.
    pub async fn setup(&self, principal: &Principal) -> Result<Enrollment, TwoFactorError> {
        let raw = Secret::generate_secret()
            .to_bytes()
            .map_err(|e| crypto_error(format!("secret generation: {e:?}")))?;
        let totp = self.totp(raw, &account_label(&principal.email))?;

        let qr = totp
            .get_qr_base64()
            .map_err(|e| crypto_error(format!("qr generation: {e}")))?;
        let enrollment = Enrollment {
            secret: totp.get_secret_base32(),
            provisioning_uri: totp.get_url(),
            qr_code: format!("data:image/png;base64,{qr}"),
        };

        let user_id = principal.user_id;
        let secret = enrollment.secret.clone();
        let staged = self
            .store
            .run(move |store| store.stage_totp_secret(user_id, &secret))
            .await
            .map_err(not_found_as_user)?;
        if !staged {
            tracing::debug!(user_id, "two-factor setup rejected: already enabled");
            return Err(TwoFactorError::AlreadyEnabled);
        }

        tracing::info!(user_id, "two-factor enrollment started");
        Ok(enrollment)
    }

    /// Confirms the stored secret with a current code, enables the factor
    /// and returns freshly issued plaintext backup codes.
    pub async fn enable(&self, user_id: i64, code: &str) -> Result<Vec<String>, TwoFactorError> {
        let state = self.load(user_id).await?;
        let secret = state.secret.ok_or(TwoFactorError::SetupNotInitiated)?;

        if !self.check_code(&secret, code)? {
            tracing::debug!(user_id, "two-factor enable rejected: code mismatch");
            return Err(TwoFactorError::InvalidVerificationCode);
        }

        let codes = generate_backup_codes(BACKUP_CODE_COUNT);
        let mut hashes = Vec::with_capacity(codes.len());
        for code in &codes {
            hashes.push(self.hasher.hash_blocking(code.clone()).await?);
        }

        let next = TwoFactorState {
            enabled: true,
            secret: Some(secret),
            backup_codes: hashes,
        };
        self.store
            .run(move |store| store.set_totp_state(user_id, &next))
            .await
            .map_err(not_found_as_user)?;

        tracing::info!(user_id, "two-factor enabled");
        Ok(codes)
    }

    /// Clears the secret and backup codes after re-checking the password.
    /// Succeeds without change when the factor is already off.
    pub async fn disable(&self, user_id: i64, password: &str) -> Result<(), TwoFactorError> {
        let hash = self
            .store
            .run(move |store| store.get_user_password_hash(user_id))
            .await?
            .ok_or(TwoFactorError::NotFound)?;

        if !self.hasher.verify_blocking(password.to_string(), hash).await? {
            tracing::debug!(user_id, "two-factor disable rejected: wrong password");
            return Err(TwoFactorError::IncorrectPassword);
        }

        self.store
            .run(move |store| store.set_totp_state(user_id, &TwoFactorState::default()))
            .await
            .map_err(not_found_as_user)?;

        tracing::info!(user_id, "two-factor disabled");
        Ok(())
    }

    /// Reports only whether the factor is enabled; a pending enrollment
    /// reads as not enabled.
    pub async fn status(&self, user_id: i64) -> Result<bool, TwoFactorError> {
        Ok(self.load(user_id).await?.phase() == TwoFactorPhase::Enabled)
    }

    /// Checks a TOTP code for a user whose factor is enabled.
    pub async fn verify_code(&self, user_id: i64, code: &str) -> Result<bool, TwoFactorError> {
        let state = self.load(user_id).await?;
        match (state.phase(), state.secret) {
            (TwoFactorPhase::Enabled, Some(secret)) => self.check_code(&secret, code),
            _ => Ok(false),
        }
    }

    /// Consumes one backup code. Returns false when no unused code matches;
    /// a code that matched once never matches again.
    pub async fn consume_backup_code(
        &self,
        user_id: i64,
        code: &str,
    ) -> Result<bool, TwoFactorError> {
        let code = code.trim().to_ascii_uppercase();

        for _ in 0..CONSUME_ATTEMPTS {
            let state = self.load(user_id).await?;
            if state.phase() != TwoFactorPhase::Enabled {
                return Ok(false);
            }

            let mut matched = None;
            for (idx, hash) in state.backup_codes.iter().enumerate() {
                if self
                    .hasher
                    .verify_blocking(code.clone(), hash.clone())
                    .await?
                {
                    matched = Some(idx);
                    break;
                }
            }
            let Some(idx) = matched else {
                return Ok(false);
            };

            let expected = state.backup_codes;
            let mut remaining = expected.clone();
            remaining.remove(idx);
            let left = remaining.len();

            let swapped = self
                .store
                .run(move |store| store.swap_backup_codes(user_id, &expected, &remaining))
                .await?;
            if swapped {
                tracing::info!(user_id, remaining = left, "backup code consumed");
                return Ok(true);
            }
            // Another request changed the codes first; re-read and retry.
        }

        Ok(false)
    }

    async fn load(&self, user_id: i64) -> Result<TwoFactorState, TwoFactorError> {
        self.store
            .run(move |store| store.get_totp_state(user_id))
            .await?
            .ok_or(TwoFactorError::NotFound)
    }

    fn totp(&self, secret: Vec<u8>, account: &str) -> Result<TOTP, TwoFactorError> {
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| crypto_error(format!("totp init: {e}")))
    }

    fn check_code(&self, secret_base32: &str, code: &str) -> Result<bool, TwoFactorError> {
        let bytes = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|e| crypto_error(format!("stored secret unreadable: {e:?}")))?;
        // The account label plays no part in code verification.
        let totp = self.totp(bytes, "user")?;

        totp.check_current(code.trim())
            .map_err(|e| crypto_error(format!("system clock: {e}")))
    }
}

/// Authenticator account label. `:` separates issuer and account in
/// provisioning URIs, so it cannot appear in either.
fn account_label(email: &str) -> String {
    email.replace(':', "_")
}

fn crypto_error(message: String) -> TwoFactorError {
    TwoFactorError::Internal(StoreError::Crypto(message))
}

fn not_found_as_user(err: StoreError) -> TwoFactorError {
    match err {
        StoreError::NotFound => TwoFactorError::NotFound,
        other => TwoFactorError::Internal(other),
    }
}
