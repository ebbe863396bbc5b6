//! # SprintGate
//!
//! Request authentication, rate limiting, project role checks and TOTP
//! second-factor management for a multi-tenant project-management API.
//! Usable both as a standalone binary and as a library.
//!
//! ## Library Usage
//!
//! ```toml
//! [dependencies]
//! sprintgate = { version = "0.0.1", default-features = false }
//! ```
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use sprintgate::config::ServerConfig;
//! use sprintgate::server::{AppState, create_router};
//! use sprintgate::store::{SqliteStore, Store};
//!
//! let config = ServerConfig {
//!     jwt_secret: std::env::var("SPRINTGATE_JWT_SECRET").unwrap(),
//!     ..ServerConfig::default()
//! };
//! config.validate().unwrap();
//!
//! let store = SqliteStore::new(config.db_path()).unwrap();
//! store.initialize().unwrap();
//!
//! let state = Arc::new(AppState::new(Arc::new(store), config));
//! let router = create_router(state);
//! // Serve with axum, using `into_make_service_with_connect_info::<SocketAddr>()`
//! // so the rate limiter can see peer addresses.
//! ```
//!
//! ## Feature Flags
//!
//! - `cli` (default): Builds the `sprintgate` binary. Disable with `default-features = false`.

pub mod access;
pub mod auth;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod server;
pub mod store;
pub mod twofactor;
pub mod types;
