use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};

use crate::auth::RequireAuth;
use crate::server::AppState;
use crate::server::dto::{AddMemberRequest, UpdateMemberRequest};
use crate::server::response::{ApiError, ApiJson, ApiPath, ApiResponse};

pub async fn list_members(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiPath(project_id): ApiPath<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let members = state.guard.list_members(&principal, project_id).await?;
    Ok(Json(ApiResponse::success(members)))
}

pub async fn add_member(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiPath(project_id): ApiPath<i64>,
    ApiJson(req): ApiJson<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let email = req.email.trim().to_lowercase();
    let membership = state
        .guard
        .add_member(&principal, project_id, &email, &req.role)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(membership))))
}

pub async fn update_member(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiPath((project_id, member_id)): ApiPath<(i64, i64)>,
    ApiJson(req): ApiJson<UpdateMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let membership = state
        .guard
        .update_member_role(&principal, project_id, member_id, &req.role)
        .await?;

    Ok(Json(ApiResponse::success(membership)))
}

pub async fn remove_member(
    RequireAuth(principal): RequireAuth,
    State(state): State<Arc<AppState>>,
    ApiPath((project_id, member_id)): ApiPath<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .guard
        .remove_member(&principal, project_id, member_id)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
