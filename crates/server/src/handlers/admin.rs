//! Administrative endpoints. All routes here sit behind the admin token.

use super::common::{parse_vault_key, read_json};
use crate::engine::{Job, JobReport, PopularEntry, UserUsage, VaultInfo};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use pinfold_metadata::{UserRow, UserVaultRow, VaultRow};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

fn format_time(value: OffsetDateTime, field: &str) -> ApiResult<String> {
    value
        .format(&Rfc3339)
        .map_err(|e| ApiError::Internal(format!("failed to format {field}: {e}")))
}

// =============================================================================
// Vaults
// =============================================================================

/// GET /v1/admin/vaults/popular - Last computed popularity index.
pub async fn popular_vaults(State(state): State<AppState>) -> Json<Vec<PopularEntry>> {
    Json(state.engine.popular_vaults())
}

/// GET /v1/admin/vaults/{key} - Full vault info.
pub async fn get_vault_info(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<VaultInfo>> {
    let key = parse_vault_key(&key)?;
    Ok(Json(state.engine.vault_info(&key).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovedVaultResponse {
    pub key: String,
    pub removed_users: Vec<String>,
}

/// DELETE /v1/admin/vaults/{key} - Drop every hosting user and close the vault.
pub async fn delete_vault(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<RemovedVaultResponse>> {
    let key = parse_vault_key(&key)?;
    let removed_users = state.engine.admin_remove_vault(&key).await?;
    Ok(Json(RemovedVaultResponse {
        key: key.to_hex(),
        removed_users,
    }))
}

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserRequest {
    /// Defaults to a random UUID.
    #[serde(default)]
    pub id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub disk_quota: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserVaultResponse {
    pub key: String,
    pub name: Option<String>,
    pub added_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    /// `None` when the configured default applies.
    pub disk_quota_override: Option<u64>,
    #[serde(flatten)]
    pub usage: UserUsage,
    pub vaults: Vec<UserVaultResponse>,
    pub created_at: String,
    pub updated_at: String,
}

async fn user_response(state: &AppState, user: UserRow) -> ApiResult<UserResponse> {
    let vaults = state
        .metadata
        .list_user_vaults(&user.id)
        .await?
        .into_iter()
        .map(|row: UserVaultRow| {
            Ok(UserVaultResponse {
                added_at: format_time(row.added_at, "added_at")?,
                key: row.vault_key,
                name: row.name,
            })
        })
        .collect::<ApiResult<Vec<_>>>()?;

    let disk_quota = state.config.quota.quota_for(user.disk_quota_bytes())?;
    Ok(UserResponse {
        usage: UserUsage {
            disk_usage: user.disk_usage_bytes(),
            disk_quota,
            quota_pct: state.engine.quota_pct(&user)?,
        },
        disk_quota_override: user.disk_quota_bytes(),
        vaults,
        created_at: format_time(user.created_at, "created_at")?,
        updated_at: format_time(user.updated_at, "updated_at")?,
        id: user.id,
        username: user.username,
        email: user.email,
    })
}

async fn load_user(state: &AppState, user_id: &str) -> ApiResult<UserRow> {
    state
        .metadata
        .get_user(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("user {user_id} not found")))
}

/// POST /v1/admin/users - Create a user.
pub async fn create_user(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    let body: CreateUserRequest = read_json(req).await?;

    let username = body.username.trim();
    if username.is_empty() {
        return Err(ApiError::BadRequest("username cannot be empty".to_string()));
    }
    let id = match body.id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("id cannot be empty".to_string()));
        }
        Some(id) => id,
        None => Uuid::new_v4().to_string(),
    };

    let mut user = UserRow::new(id, username);
    user.email = body.email;
    state.metadata.create_user(&user).await?;
    if body.disk_quota.is_some() {
        state
            .metadata
            .set_user_disk_quota(&user.id, body.disk_quota)
            .await?;
    }

    tracing::info!(user_id = %user.id, username = %user.username, "User created");
    let user = load_user(&state, &user.id).await?;
    Ok((StatusCode::CREATED, Json(user_response(&state, user).await?)))
}

/// GET /v1/admin/users/{user_id} - User with usage and hosted vaults.
pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserResponse>> {
    let user = load_user(&state, &user_id).await?;
    Ok(Json(user_response(&state, user).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQuotaRequest {
    /// Quota in bytes; `null` restores the configured default.
    pub disk_quota: Option<u64>,
}

/// PUT /v1/admin/users/{user_id}/quota - Set or clear the quota override.
///
/// Flocking of the user's vaults is recomputed in the background.
pub async fn set_user_quota(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    req: Request,
) -> ApiResult<Json<UserResponse>> {
    let body: SetQuotaRequest = read_json(req).await?;
    load_user(&state, &user_id).await?;

    state
        .metadata
        .set_user_disk_quota(&user_id, body.disk_quota)
        .await?;
    state.engine.spawn_user_recompute(&user_id);

    let user = load_user(&state, &user_id).await?;
    Ok(Json(user_response(&state, user).await?))
}

// =============================================================================
// Hosting
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct HostVaultRequest {
    pub key: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostedVaultResponse {
    pub key: String,
    pub name: Option<String>,
    pub owner_name: Option<String>,
    pub hosting_users: Vec<String>,
}

impl From<VaultRow> for HostedVaultResponse {
    fn from(row: VaultRow) -> Self {
        Self {
            key: row.key,
            name: row.name,
            owner_name: row.owner_name,
            hosting_users: row.hosting_users,
        }
    }
}

/// POST /v1/admin/users/{user_id}/vaults - Host a vault for the user.
pub async fn add_user_vault(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    req: Request,
) -> ApiResult<(StatusCode, Json<HostedVaultResponse>)> {
    let body: HostVaultRequest = read_json(req).await?;
    let key = parse_vault_key(&body.key)?;

    let record = state
        .engine
        .add_hosted_vault(&user_id, &key, body.name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

/// DELETE /v1/admin/users/{user_id}/vaults/{key} - Stop hosting a vault.
pub async fn remove_user_vault(
    State(state): State<AppState>,
    Path((user_id, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let key = parse_vault_key(&key)?;
    if !state.engine.remove_hosted_vault(&user_id, &key).await? {
        return Err(ApiError::NotFound(format!(
            "user {user_id} does not host vault {key}"
        )));
    }
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Jobs
// =============================================================================

/// POST /v1/admin/jobs/{job} - Run a background job now.
pub async fn run_job(
    State(state): State<AppState>,
    Path(job): Path<String>,
) -> ApiResult<Json<JobReport>> {
    let job: Job = job.parse().map_err(ApiError::BadRequest)?;
    Ok(Json(state.engine.run_job(job).await?))
}
