//! User repository.

use crate::error::MetadataResult;
use crate::models::{UserRow, UserVaultRow};
use async_trait::async_trait;
use pinfold_core::VaultKey;

/// Repository for user records and their hosted-vault lists.
#[async_trait]
pub trait UserRepo: Send + Sync {
    /// Create a user. Fails with `AlreadyExists` on a duplicate id or username.
    async fn create_user(&self, user: &UserRow) -> MetadataResult<()>;

    async fn get_user(&self, user_id: &str) -> MetadataResult<Option<UserRow>>;

    async fn get_user_by_username(&self, username: &str) -> MetadataResult<Option<UserRow>>;

    async fn list_users(&self) -> MetadataResult<Vec<UserRow>>;

    /// Overwrite the aggregate disk usage. `NotFound` for unknown users.
    async fn update_user_disk_usage(&self, user_id: &str, disk_usage: u64) -> MetadataResult<()>;

    /// Set or clear the quota override. `NotFound` for unknown users.
    async fn set_user_disk_quota(&self, user_id: &str, quota: Option<u64>) -> MetadataResult<()>;

    /// Add a vault to the user's list, or rename it if already present.
    async fn add_user_vault(
        &self,
        user_id: &str,
        key: &VaultKey,
        name: Option<&str>,
    ) -> MetadataResult<()>;

    /// Remove a vault from the user's list. Returns whether it was listed.
    async fn remove_user_vault(&self, user_id: &str, key: &VaultKey) -> MetadataResult<bool>;

    /// Vaults on the user's list, oldest first.
    async fn list_user_vaults(&self, user_id: &str) -> MetadataResult<Vec<UserVaultRow>>;
}
