use std::sync::Arc;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use super::Principal;
use crate::server::AppState;
use crate::server::response::ApiError;

/// Extractor that requires a resolved principal. Handlers receive the
/// principal by value; nothing is stashed in request extensions.
pub struct RequireAuth(pub Principal);

impl FromRequestParts<Arc<AppState>> for RequireAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok());

        let principal = state.resolver.resolve(auth_header).await?;
        Ok(RequireAuth(principal))
    }
}
