//! Bearer-token extraction and verification for the `/ws` upgrade (spec
//! §6.4). Verification itself is pluggable — the gateway never pins a
//! concrete identity provider — so the HTTP boundary depends only on the
//! [`TokenVerifier`] trait and its two distinguished failure cases.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub user_id: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("no bearer token presented")]
    NoToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("verifier error: {0}")]
    Other(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<VerifiedUser, VerifyError>;
}

#[must_use]
pub fn extract_bearer(header_value: &str) -> Option<&str> {
    header_value.strip_prefix("Bearer ")
}

/// In-memory [`TokenVerifier`] test double: the bearer token itself is the
/// user id, with an optional denylist for simulating revoked tokens.
pub struct StaticTokenVerifier {
    denied: std::collections::HashSet<String>,
}

impl StaticTokenVerifier {
    #[must_use]
    pub fn new() -> Self {
        Self { denied: std::collections::HashSet::new() }
    }

    #[must_use]
    pub fn with_denied(denied: impl IntoIterator<Item = String>) -> Self {
        Self { denied: denied.into_iter().collect() }
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<VerifiedUser, VerifyError> {
        if bearer.is_empty() {
            return Err(VerifyError::NoToken);
        }
        if self.denied.contains(bearer) {
            return Err(VerifyError::InvalidToken);
        }
        Ok(VerifiedUser { user_id: bearer.to_owned() })
    }
}
