//! Database models mapping to the metadata schema.

use pinfold_core::{VaultKey, VaultStats};
use sqlx::FromRow;
use time::OffsetDateTime;

/// Clamp an unsigned counter into SQLite's signed integer column.
pub(crate) fn to_db(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

// =============================================================================
// Users
// =============================================================================

/// Registered user record.
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: Option<String>,
    /// Sum of the disk usage of every hosted vault, as of the last recompute.
    pub disk_usage: i64,
    /// Explicit quota override in bytes. `None` means the configured default.
    pub disk_quota: Option<i64>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserRow {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: id.into(),
            username: username.into(),
            email: None,
            disk_usage: 0,
            disk_quota: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn disk_usage_bytes(&self) -> u64 {
        from_db(self.disk_usage)
    }

    pub fn disk_quota_bytes(&self) -> Option<u64> {
        self.disk_quota.map(from_db)
    }
}

/// A vault on a user's hosting list.
#[derive(Debug, Clone, FromRow)]
pub struct UserVaultRow {
    pub user_id: String,
    pub vault_key: String,
    pub name: Option<String>,
    pub added_at: OffsetDateTime,
}

impl UserVaultRow {
    pub fn key(&self) -> crate::MetadataResult<VaultKey> {
        parse_key(&self.vault_key)
    }
}

// =============================================================================
// Vaults
// =============================================================================

/// Vault record with cached accounting.
#[derive(Debug, Clone, FromRow)]
pub struct VaultRow {
    pub key: String,
    pub name: Option<String>,
    pub owner_name: Option<String>,
    /// Cached on-disk byte count; `None` until first measured.
    pub disk_usage: Option<i64>,
    pub num_blocks: i64,
    pub num_downloaded_blocks: i64,
    pub num_bytes: i64,
    pub num_files: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Filled from `vault_hosting_users`, ordered by when each user was added.
    #[sqlx(skip)]
    pub hosting_users: Vec<String>,
}

impl VaultRow {
    pub fn vault_key(&self) -> crate::MetadataResult<VaultKey> {
        parse_key(&self.key)
    }

    pub fn stats(&self) -> VaultStats {
        VaultStats {
            num_blocks: from_db(self.num_blocks),
            num_downloaded_blocks: from_db(self.num_downloaded_blocks),
            num_bytes: from_db(self.num_bytes),
            num_files: from_db(self.num_files),
        }
    }

    pub fn disk_usage_bytes(&self) -> Option<u64> {
        self.disk_usage.map(from_db)
    }
}

/// Partial update applied to a vault record. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct VaultUpdate {
    pub name: Option<String>,
    pub owner_name: Option<String>,
    pub disk_usage: Option<u64>,
    pub stats: Option<VaultStats>,
}

impl VaultUpdate {
    pub fn disk_usage(bytes: u64) -> Self {
        Self {
            disk_usage: Some(bytes),
            ..Default::default()
        }
    }

    pub fn stats(stats: VaultStats) -> Self {
        Self {
            stats: Some(stats),
            ..Default::default()
        }
    }
}

/// Descriptive fields recorded when a user starts hosting a vault.
#[derive(Debug, Clone)]
pub struct HostingDetails {
    pub name: Option<String>,
    pub owner_name: String,
}

pub(crate) fn parse_key(hex: &str) -> crate::MetadataResult<VaultKey> {
    VaultKey::from_hex(hex)
        .map_err(|e| crate::MetadataError::Internal(format!("stored vault key {hex:?}: {e}")))
}
