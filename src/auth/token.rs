use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;
use rand::RngCore;
use sha2::{Digest, Sha256};

const KEY_BYTES: usize = 32;
const PREFIX_LENGTH: usize = 8;

/// A freshly minted API key. `raw` is shown to the caller once and then dropped.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub raw: String,
    pub digest: String,
    pub prefix: String,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ApiKeyGenerator;

impl ApiKeyGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Generates a new opaque key: 32 random bytes, URL-safe base64.
    #[must_use]
    pub fn generate(&self) -> GeneratedKey {
        let mut bytes = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let raw = URL_SAFE.encode(bytes);

        GeneratedKey {
            digest: self.digest(&raw),
            prefix: key_prefix(&raw),
            raw,
        }
    }

    /// One-way digest stored in place of the key. Deterministic so lookups
    /// can go straight to the unique index.
    #[must_use]
    pub fn digest(&self, raw: &str) -> String {
        URL_SAFE.encode(Sha256::digest(raw.as_bytes()))
    }
}

fn key_prefix(raw: &str) -> String {
    raw.chars().take(PREFIX_LENGTH).collect()
}
