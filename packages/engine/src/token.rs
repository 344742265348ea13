//! Short-lived execution tokens minted for the child runtime.

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Claims carried by the per-execution token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobClaims {
    /// Submitter user id; empty for anonymous submissions.
    pub sub: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

impl JobClaims {
    pub fn new(sub: String, role: String, email: Option<String>, ttl_seconds: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub,
            role,
            email,
            iat: now,
            exp: now + ttl_seconds,
        }
    }
}

/// Opaque signer the engine consumes; issuance policy lives with the host.
pub trait TokenSigner: Send + Sync {
    fn sign(&self, claims: &JobClaims) -> Result<String>;
}

/// Default HS256 signer backed by the engine's configured secret.
pub struct Hs256TokenSigner {
    key: EncodingKey,
}

impl Hs256TokenSigner {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }
}

impl TokenSigner for Hs256TokenSigner {
    fn sign(&self, claims: &JobClaims) -> Result<String> {
        encode(&Header::default(), claims, &self.key)
            .map_err(|e| EngineError::Storage(format!("token signing failed: {e}")))
    }
}
