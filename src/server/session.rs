use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::auth::RequireAuth;
use crate::error::Error;
use crate::server::AppState;
use crate::server::dto::{LoginRequest, SessionResponse, SignupRequest};
use crate::server::response::{ApiError, ApiJson, ApiResponse};
use crate::server::validation::{validate_email, validate_password};
use crate::types::User;

pub async fn signup(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<SignupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    validate_email(&email)?;
    validate_password(&req.password)?;

    let password_hash = state.hasher.hash_blocking(req.password).await?;
    let user = state
        .store
        .run(move |store| store.create_user(&email, &password_hash))
        .await
        .map_err(|e| match e {
            Error::AlreadyExists => ApiError::conflict("Email already registered"),
            other => other.into(),
        })?;

    tracing::info!(user_id = user.id, "user signed up");
    let token = state.signer.issue(&user)?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(SessionResponse { token, user })),
    ))
}

pub async fn login(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = authenticate(&state, &req).await?;

    if state.two_factor.status(user.id).await? {
        let passed = match (req.totp_code.as_deref(), req.backup_code.as_deref()) {
            (Some(code), _) => state.two_factor.verify_code(user.id, code).await?,
            (None, Some(code)) => state.two_factor.consume_backup_code(user.id, code).await?,
            (None, None) => return Err(ApiError::totp_required()),
        };
        if !passed {
            tracing::debug!(user_id = user.id, "login rejected: second factor mismatch");
            return Err(ApiError::invalid_credentials());
        }
    }

    let token = state.signer.issue(&user)?;
    Ok(Json(ApiResponse::success(SessionResponse { token, user })))
}

/// Checks email and password. Unknown email and wrong password are
/// indistinguishable to the caller.
async fn authenticate(state: &AppState, req: &LoginRequest) -> Result<User, ApiError> {
    let email = req.email.trim().to_lowercase();
    let found = state
        .store
        .run(move |store| {
            let Some(user) = store.get_user_by_email(&email)? else {
                return Ok(None);
            };
            let hash = store.get_user_password_hash(user.id)?;
            Ok(hash.map(|hash| (user, hash)))
        })
        .await?;

    let (user, hash) = found.unzip();
    let verified = state
        .hasher
        .verify_or_decoy_blocking(req.password.clone(), hash)
        .await?;

    match user {
        Some(user) if verified => Ok(user),
        Some(user) => {
            tracing::debug!(user_id = user.id, "login rejected: wrong password");
            Err(ApiError::invalid_credentials())
        }
        None => {
            tracing::debug!("login rejected: unknown email");
            Err(ApiError::invalid_credentials())
        }
    }
}

pub async fn me(RequireAuth(principal): RequireAuth) -> impl IntoResponse {
    Json(ApiResponse::success(principal))
}
