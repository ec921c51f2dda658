//! Vault repository.

use crate::error::MetadataResult;
use crate::models::{HostingDetails, VaultRow, VaultUpdate};
use async_trait::async_trait;
use pinfold_core::VaultKey;

/// Repository for vault records, hosting users and dead-vault tracking.
///
/// A vault becomes dead when its last hosting user is removed and stops
/// being dead when a hosting user is added again. Deleting the record
/// clears both.
#[async_trait]
pub trait VaultRepo: Send + Sync {
    /// Get a vault together with its hosting users.
    async fn get_vault(&self, key: &VaultKey) -> MetadataResult<Option<VaultRow>>;

    async fn list_vault_keys(&self) -> MetadataResult<Vec<VaultKey>>;

    /// Apply a partial update and return the new record. `NotFound` if missing.
    async fn update_vault(&self, key: &VaultKey, update: &VaultUpdate) -> MetadataResult<VaultRow>;

    /// Delete the record, its hosting users and its dead marker.
    /// Returns whether a record existed.
    async fn delete_vault(&self, key: &VaultKey) -> MetadataResult<bool>;

    /// Add a hosting user, creating the record if needed.
    ///
    /// At most one hosting user per vault: a different existing user yields
    /// `AlreadyHosted`. Re-adding the current user updates the details.
    async fn add_hosting_user(
        &self,
        key: &VaultKey,
        user_id: &str,
        details: &HostingDetails,
    ) -> MetadataResult<VaultRow>;

    /// Remove a hosting user and return how many remain. Reaching zero marks
    /// the vault dead.
    async fn remove_hosting_user(&self, key: &VaultKey, user_id: &str) -> MetadataResult<usize>;

    /// Keys of vaults with no hosting users.
    async fn list_dead_vault_keys(&self) -> MetadataResult<Vec<VaultKey>>;
}
