//! Shared handler helpers.

use crate::error::{ApiError, ApiResult};
use axum::extract::Request;
use pinfold_core::VaultKey;
use serde::de::DeserializeOwned;

/// Maximum request body size for JSON endpoints (1 MiB).
const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Parse a vault key from a path segment.
pub fn parse_vault_key(raw: &str) -> ApiResult<VaultKey> {
    VaultKey::from_hex(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Read and deserialize a JSON request body.
pub async fn read_json<T: DeserializeOwned>(req: Request) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), MAX_BODY_SIZE)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}
