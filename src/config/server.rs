use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// HMAC secret shared by every instance that signs or verifies session tokens.
    pub jwt_secret: String,
    pub jwt_expiry: Duration,
    /// Burst size of the general per-client bucket.
    pub rate_limit: u32,
    /// Burst size of the stricter bucket in front of signup and login.
    pub auth_rate_limit: u32,
    pub rate_limit_refill_per_sec: f64,
    /// Honour `X-Real-IP` / `X-Forwarded-For` when deriving the rate-limit key.
    /// Only safe behind a proxy that overwrites both headers.
    pub trust_proxy_headers: bool,
    pub store_timeout: Duration,
    pub totp_issuer: String,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("sprintgate.db")
    }

    pub fn validate(&self) -> Result<()> {
        if self.jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(Error::Config(format!(
                "jwt secret must be at least {MIN_JWT_SECRET_LEN} bytes"
            )));
        }
        if self.rate_limit == 0 || self.auth_rate_limit == 0 {
            return Err(Error::Config("rate limit capacity must be positive".into()));
        }
        if !(self.rate_limit_refill_per_sec > 0.0) {
            return Err(Error::Config("rate limit refill must be positive".into()));
        }
        if self.store_timeout.is_zero() {
            return Err(Error::Config("store timeout must be positive".into()));
        }
        if self.totp_issuer.is_empty() || self.totp_issuer.contains(':') {
            return Err(Error::Config(
                "totp issuer must be non-empty and must not contain ':'".into(),
            ));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            jwt_secret: String::new(),
            jwt_expiry: Duration::from_secs(24 * 60 * 60),
            rate_limit: 100,
            auth_rate_limit: 20,
            rate_limit_refill_per_sec: 1.0,
            trust_proxy_headers: true,
            store_timeout: Duration::from_secs(5),
            totp_issuer: "SprintGate".to_string(),
        }
    }
}
