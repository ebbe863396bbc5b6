use std::sync::Arc;
use std::time::Instant;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{
    Router,
    routing::{delete, get, patch, post},
};

use super::{keys, members, session, settings};
use crate::access::ProjectRoleGuard;
use crate::auth::{ApiKeyGenerator, CredentialResolver, SecretHasher, SessionSigner};
use crate::config::ServerConfig;
use crate::ratelimit::{self, RateLimiter};
use crate::store::{Store, StoreHandle};
use crate::twofactor::TwoFactorManager;

pub struct AppState {
    pub store: StoreHandle,
    pub config: ServerConfig,
    pub resolver: CredentialResolver,
    pub guard: ProjectRoleGuard,
    pub two_factor: TwoFactorManager,
    pub signer: SessionSigner,
    pub hasher: SecretHasher,
    pub keys: ApiKeyGenerator,
    /// General per-client limiter for every `/api` route.
    pub limiter: Arc<RateLimiter>,
    /// Stricter limiter stacked on signup and login.
    pub auth_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: ServerConfig) -> Self {
        Self::with_hasher(store, config, SecretHasher::new())
    }

    pub fn with_hasher(store: Arc<dyn Store>, config: ServerConfig, hasher: SecretHasher) -> Self {
        let store = StoreHandle::new(store, config.store_timeout);
        let signer = SessionSigner::new(&config.jwt_secret, config.jwt_expiry);
        let limiter = |capacity| {
            Arc::new(
                RateLimiter::new(capacity, config.rate_limit_refill_per_sec)
                    .trust_proxy_headers(config.trust_proxy_headers),
            )
        };

        Self {
            resolver: CredentialResolver::new(store.clone(), signer.clone()),
            guard: ProjectRoleGuard::new(store.clone()),
            two_factor: TwoFactorManager::new(
                store.clone(),
                hasher.clone(),
                config.totp_issuer.clone(),
            ),
            limiter: limiter(config.rate_limit),
            auth_limiter: limiter(config.auth_rate_limit),
            keys: ApiKeyGenerator::new(),
            signer,
            hasher,
            store,
            config,
        }
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status();

    tracing::info!(
        "{} {} {} {}ms",
        method,
        uri.path(),
        status.as_u16(),
        latency.as_millis()
    );

    response
}

fn session_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/signup", post(session::signup))
        .route("/login", post(session::login))
        .layer(middleware::from_fn_with_state(
            state.auth_limiter.clone(),
            ratelimit::enforce,
        ))
}

fn api_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .nest("/auth", session_router(state))
        .route("/me", get(session::me))
        // API key routes
        .route("/keys", post(keys::create_key).get(keys::list_keys))
        .route("/keys/{id}", delete(keys::delete_key))
        // Project membership routes
        .route(
            "/projects/{id}/members",
            get(members::list_members).post(members::add_member),
        )
        .route(
            "/projects/{id}/members/{member_id}",
            patch(members::update_member).delete(members::remove_member),
        )
        // Account settings routes
        .route("/settings/password", post(settings::change_password))
        .route("/settings/2fa/setup", post(settings::setup_two_factor))
        .route("/settings/2fa/enable", post(settings::enable_two_factor))
        .route("/settings/2fa/disable", post(settings::disable_two_factor))
        .route("/settings/2fa/status", get(settings::two_factor_status))
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            ratelimit::enforce,
        ))
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest("/api", api_router(&state))
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}
