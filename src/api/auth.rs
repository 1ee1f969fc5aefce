//! Bearer API-key authentication middleware.
//!
//! Strips the `Bearer ` prefix, looks the key up by its SHA-256 hash, and
//! inserts the authenticated principal into the request's extensions for
//! downstream handlers to pull out. Keys are opaque per-client tokens
//! minted by an operator through the admin surface — there is no login
//! flow of its own.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Request};
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::store::ApiKey;

use super::AppState;

/// The authenticated caller, attached to the request extensions by
/// [`require_api_key`] for handlers to pull out with `Extension<AuthedKey>`.
#[derive(Debug, Clone)]
pub struct AuthedKey {
    pub key: ApiKey,
}

/// Hex-encoded SHA-256 of the raw key, the form stored as `ApiKey.key_hash`.
pub fn hash_key(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, GatewayError> {
    let raw_key = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(GatewayError::auth_required)?;

    let key = state
        .store
        .find_api_key_by_hash(&hash_key(raw_key))
        .await
        .map_err(|_| GatewayError::auth_required())?;

    if !key.active {
        return Err(GatewayError::forbidden("API key has been deactivated"));
    }
    if key.is_expired() {
        return Err(GatewayError::auth_expired());
    }

    req.extensions_mut().insert(AuthedKey { key });
    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_is_deterministic_and_hex() {
        let a = hash_key("sk-test-123");
        let b = hash_key("sk-test-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_key_differs_for_different_input() {
        assert_ne!(hash_key("sk-a"), hash_key("sk-b"));
    }
}
