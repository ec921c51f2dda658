//! Public vault endpoints: health, status, live progress and manifest.

use super::common::parse_vault_key;
use crate::engine::VaultStatus;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use pinfold_core::ProgressEvent;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated so probes and load balancers can reach it. Returns only
/// status and version.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /v1/vaults/{key}/status - Download progress and peers.
pub async fn vault_status(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<VaultStatus>> {
    let key = parse_vault_key(&key)?;
    Ok(Json(state.engine.vault_status(&key).await?))
}

/// GET /v1/vaults/{key}/progress - Server-sent `progress` events.
///
/// The first event carries the current value; later ones follow each stats
/// recomputation. Slow clients skip missed events rather than disconnect.
pub async fn vault_progress(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let key = parse_vault_key(&key)?;
    if state.engine.get_vault(&key).is_none() && !state.engine.is_loading(&key) {
        return Err(ApiError::NotFound(format!("vault {key} is not loaded")));
    }

    let mut rx = state.engine.progress().subscribe(&key);
    let current = ProgressEvent {
        progress: state.engine.get_download_progress(&key),
        disk_usage: state.engine.get_vault(&key).and_then(|h| h.disk_usage()),
    };

    let stream = async_stream::stream! {
        yield Event::default().event("progress").json_data(current);
        loop {
            match rx.recv().await {
                Ok(event) => yield Event::default().event("progress").json_data(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(vault = %key, skipped, "Progress subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// GET /v1/vaults/{key}/manifest - The vault's `dpack.json`.
pub async fn vault_manifest(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Value>> {
    let key = parse_vault_key(&key)?;
    state
        .engine
        .get_manifest(&key)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no manifest for vault {key}")))
}
