use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use crate::auth::RequireAuth;
use crate::server::AppState;
use crate::server::dto::{
    BackupCodesResponse, ChangePasswordRequest, DisableTwoFactorRequest, EnableTwoFactorRequest,
    TwoFactorStatusResponse,
};
use crate::server::response::{ApiError, ApiJson, ApiResponse};
use crate::server::validation::validate_password;

pub async fn change_password(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<ChangePasswordRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_password(&req.new_password)?;

    let user_id = principal.user_id;
    let current_hash = state
        .store
        .run(move |store| store.get_user_password_hash(user_id))
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;

    if !state
        .hasher
        .verify_blocking(req.current_password, current_hash)
        .await?
    {
        return Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "Current password is incorrect",
        ));
    }

    let new_hash = state.hasher.hash_blocking(req.new_password).await?;
    state
        .store
        .run(move |store| store.update_user_password(user_id, &new_hash))
        .await?;

    tracing::info!(user_id, "password changed");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn setup_two_factor(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let enrollment = state.two_factor.setup(&principal).await?;
    Ok(Json(ApiResponse::success(enrollment)))
}

pub async fn enable_two_factor(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<EnableTwoFactorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let backup_codes = state
        .two_factor
        .enable(principal.user_id, &req.code)
        .await?;

    Ok(Json(ApiResponse::success(BackupCodesResponse {
        backup_codes,
    })))
}

pub async fn disable_two_factor(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<DisableTwoFactorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .two_factor
        .disable(principal.user_id, &req.password)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn two_factor_status(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let enabled = state.two_factor.status(principal.user_id).await?;
    Ok(Json(ApiResponse::success(TwoFactorStatusResponse {
        enabled,
    })))
}
