//! Hosting transactions.
//!
//! A user's vault list and a vault's hosting-user set change together, with
//! both the users and vaults locks held for the whole read-modify-write.

use super::error::{EngineError, EngineResult};
use super::Vaultr;
use pinfold_core::{FlockIntent, USERS_LOCK, VAULTS_LOCK, VaultKey};
use pinfold_metadata::{HostingDetails, VaultRow};
use std::sync::Arc;
use tracing::{info, instrument, warn};

impl Vaultr {
    /// Start hosting `key` for `user_id`, then load it and join the swarm.
    ///
    /// Fails with `OutOfSpace` when the user is at or over quota, and with an
    /// already-hosted conflict when another user hosts the vault. A vault
    /// that fails to load stays recorded; the next load retries it.
    #[instrument(skip(self, key), fields(vault = %key))]
    pub async fn add_hosted_vault(
        self: &Arc<Self>,
        user_id: &str,
        key: &VaultKey,
        name: Option<&str>,
    ) -> EngineResult<VaultRow> {
        let record = {
            let _guards = self.locks.acquire_all(&[USERS_LOCK, VAULTS_LOCK]).await;

            let user = self
                .metadata
                .get_user(user_id)
                .await?
                .ok_or_else(|| EngineError::UserNotFound(user_id.to_string()))?;
            if self.quota_pct(&user)? >= 1.0 {
                return Err(EngineError::OutOfSpace {
                    user_id: user_id.to_string(),
                });
            }

            let details = HostingDetails {
                name: name.map(str::to_string),
                owner_name: user.username.clone(),
            };
            let record = self.metadata.add_hosting_user(key, user_id, &details).await?;
            self.metadata.add_user_vault(user_id, key, name).await?;
            record
        };

        match self.load_vault(key).await {
            Ok(handle) => self.set_flock_intent(&handle, FlockIntent::FULL).await?,
            Err(e) => warn!(error = %e, "Hosted vault failed to load"),
        }
        info!(user_id, "Vault hosted");
        Ok(record)
    }

    /// Stop hosting `key` for `user_id`. The vault is closed once nobody
    /// hosts it, and left for dead-vault cleanup. Returns whether anything
    /// was removed.
    #[instrument(skip(self, key), fields(vault = %key))]
    pub async fn remove_hosted_vault(
        self: &Arc<Self>,
        user_id: &str,
        key: &VaultKey,
    ) -> EngineResult<bool> {
        let removed = {
            let _guards = self.locks.acquire_all(&[USERS_LOCK, VAULTS_LOCK]).await;

            let listed = self.metadata.remove_user_vault(user_id, key).await?;
            let hosted = self
                .metadata
                .get_vault(key)
                .await?
                .is_some_and(|record| record.hosting_users.iter().any(|id| id == user_id));
            if hosted {
                let remaining = self.metadata.remove_hosting_user(key, user_id).await?;
                if remaining == 0 {
                    self.close_vault(key).await?;
                }
            }
            listed || hosted
        };

        if removed {
            info!(user_id, "Vault unhosted");
            self.spawn_user_recompute(user_id);
        }
        Ok(removed)
    }

    /// Remove every hosting user from `key` and close it. Returns the ids of
    /// the users that hosted it.
    #[instrument(skip(self, key), fields(vault = %key))]
    pub async fn admin_remove_vault(self: &Arc<Self>, key: &VaultKey) -> EngineResult<Vec<String>> {
        let hosting_users = {
            let _guards = self.locks.acquire_all(&[USERS_LOCK, VAULTS_LOCK]).await;

            let record = self
                .metadata
                .get_vault(key)
                .await?
                .ok_or_else(|| EngineError::VaultNotFound(key.to_hex()))?;
            for user_id in &record.hosting_users {
                self.metadata.remove_user_vault(user_id, key).await?;
                self.metadata.remove_hosting_user(key, user_id).await?;
            }
            self.close_vault(key).await?;
            record.hosting_users
        };

        info!(users = hosting_users.len(), "Vault removed by admin");
        for user_id in &hosting_users {
            self.spawn_user_recompute(user_id);
        }
        Ok(hosting_users)
    }
}
