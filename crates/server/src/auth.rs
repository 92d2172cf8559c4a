//! Client request authorization.
//!
//! Technically this server is an HTTP proxy and ought to speak
//! Proxy-Authorization / Proxy-Authenticate, but existing Git tooling is
//! not compatible with proxy authorization, so the normal Authorization
//! header is used instead.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use goblet_core::{Status, StatusResult};
use sha2::{Digest, Sha256};

/// Authorizes inbound client requests. Pluggable; the default checks a
/// bearer token against a configured hash.
pub trait RequestAuthorizer: Send + Sync + 'static {
    fn authorize(&self, headers: &HeaderMap) -> StatusResult<()>;
}

/// Extract the bearer token from the Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(&v[7..])
            } else {
                None
            }
        })
}

fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Authorizer accepting the one client token whose SHA-256 matches the
/// configured hash.
pub struct BearerTokenAuthorizer {
    token_hash: String,
}

impl BearerTokenAuthorizer {
    pub fn new(token_hash: String) -> Self {
        Self { token_hash }
    }
}

impl RequestAuthorizer for BearerTokenAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> StatusResult<()> {
        let token =
            extract_bearer_token(headers).ok_or_else(|| Status::unauthenticated("no auth token"))?;
        if hash_token(token) != self.token_hash {
            return Err(Status::unauthenticated("not a valid client auth token"));
        }
        Ok(())
    }
}

// Note: hex is a simple utility, we'll inline it
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}
