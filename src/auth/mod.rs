mod jwt;
mod middleware;
mod password;
mod resolver;
mod token;

use serde::Serialize;

pub use jwt::{SessionClaims, SessionSigner};
pub use middleware::RequireAuth;
pub use password::SecretHasher;
pub use resolver::{CredentialError, CredentialResolver};
pub use token::{ApiKeyGenerator, GeneratedKey};

/// The identity resolved for a single request. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: i64,
    pub email: String,
}
