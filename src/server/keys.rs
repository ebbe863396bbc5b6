use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;

use crate::auth::RequireAuth;
use crate::server::AppState;
use crate::server::dto::{CreateKeyRequest, CreateKeyResponse};
use crate::server::response::{ApiError, ApiJson, ApiPath, ApiResponse};
use crate::server::validation::{key_expiry, validate_key_name};
use crate::types::NewApiCredential;

pub async fn create_key(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateKeyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_key_name(&req.name)?;
    let expires_at = key_expiry(req.expires_in, Utc::now())?;

    let key = state.keys.generate();
    let new = NewApiCredential {
        owner_user_id: principal.user_id,
        name: req.name.trim().to_string(),
        key_hash: key.digest,
        key_prefix: key.prefix,
        expires_at,
    };
    let metadata = state
        .store
        .run(move |store| store.create_api_credential(&new))
        .await?;

    tracing::info!(
        user_id = principal.user_id,
        key_id = metadata.id,
        prefix = %metadata.key_prefix,
        "api key issued"
    );

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(CreateKeyResponse {
            key: key.raw,
            metadata,
        })),
    ))
}

pub async fn list_keys(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal.user_id;
    let keys = state
        .store
        .run(move |store| store.list_user_credentials(user_id))
        .await?;

    Ok(Json(ApiResponse::success(keys)))
}

pub async fn delete_key(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = principal.user_id;
    let deleted = state
        .store
        .run(move |store| store.delete_user_credential(user_id, id))
        .await?;

    if !deleted {
        return Err(ApiError::not_found("API key not found"));
    }

    tracing::info!(user_id, key_id = id, "api key deleted");
    Ok(StatusCode::NO_CONTENT)
}
