// API-key authentication for agents and dashboard sessions
//
// Keys are stored as sha256 hex digests; the plaintext only ever
// travels in the X-API-Key header (or api_key query parameter for
// EventSource clients, which cannot set headers).

use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::json;
use sha2::{Digest, Sha256};

use vigil_core::{ApiKeyStore, IngestIdentity};

pub const API_KEY_HEADER: &str = "x-api-key";

pub type AuthError = (StatusCode, Json<serde_json::Value>);

pub fn api_key_hash(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn unauthorized() -> AuthError {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid or missing API key"})),
    )
}

/// Resolve the caller's identity from the X-API-Key header, falling
/// back to `key` when the header is absent (SSE clients).
pub async fn authenticate(
    store: &dyn ApiKeyStore,
    headers: &HeaderMap,
    key: Option<&str>,
) -> Result<IngestIdentity, AuthError> {
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .or(key)
        .filter(|k| !k.is_empty())
        .ok_or_else(unauthorized)?;

    match store.resolve(&api_key_hash(key)).await {
        Ok(Some(identity)) => Ok(identity),
        Ok(None) => Err(unauthorized()),
        Err(e) => {
            tracing::error!(error = %e, "api key lookup failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_sha256() {
        assert_eq!(
            api_key_hash("test-key"),
            "62af8704764faf8ea82fc61ce9c4c3908b6cb97d463a634e9e587d7c885db0ef"
        );
        assert_eq!(api_key_hash("test-key").len(), 64);
    }
}
