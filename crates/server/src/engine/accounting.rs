//! Disk usage accounting and quota-driven flocking.

use super::error::{EngineError, EngineResult};
use super::Vaultr;
use futures::future::try_join_all;
use pinfold_core::{FlockIntent, VaultKey};
use pinfold_metadata::{UserRow, VaultUpdate};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument};

/// How [`Vaultr::get_disk_usage`] treats the cached value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiskUsageOptions {
    /// Measure the directory even when a cached value exists.
    pub force_update: bool,
    /// Do not recompute the hosting users' totals when the value changes.
    pub suppress_user_update: bool,
}

impl DiskUsageOptions {
    pub fn forced() -> Self {
        Self {
            force_update: true,
            suppress_user_update: false,
        }
    }
}

/// Result of a per-user recomputation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUsage {
    pub disk_usage: u64,
    pub disk_quota: u64,
    pub quota_pct: f64,
}

fn quota_pct(disk_usage: u64, disk_quota: u64) -> f64 {
    disk_usage as f64 / disk_quota.max(1) as f64
}

impl Vaultr {
    /// On-disk bytes of a loaded vault. Vaults that are not loaded report 0.
    ///
    /// The cached value (in memory, then on the record) is returned unless it
    /// is missing, zero or `force_update` is set. A fresh measurement is
    /// persisted, and when it differs from the cached value the owners'
    /// totals are recomputed in the background.
    pub async fn get_disk_usage(
        self: &Arc<Self>,
        key: &VaultKey,
        options: DiskUsageOptions,
    ) -> EngineResult<u64> {
        let Some(handle) = self.registry.get(key) else {
            return Ok(0);
        };

        if !options.force_update {
            if let Some(bytes) = handle.disk_usage().filter(|bytes| *bytes > 0) {
                return Ok(bytes);
            }
            if let Some(record) = self.metadata.get_vault(key).await?
                && let Some(bytes) = record.disk_usage_bytes().filter(|bytes| *bytes > 0)
            {
                handle.set_disk_usage(bytes);
                return Ok(bytes);
            }
        }

        let previous = handle.disk_usage();
        let measured = self.storage.disk_usage(key).await?;
        handle.set_disk_usage(measured);

        match self
            .metadata
            .update_vault(key, &VaultUpdate::disk_usage(measured))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(vault = %key, "No vault record, disk usage kept in memory only");
            }
            Err(e) => return Err(e.into()),
        }

        if previous != Some(measured) && !options.suppress_user_update {
            self.spawn_owner_recompute(key);
        }
        Ok(measured)
    }

    /// Fraction of the user's quota in use, from the stored total.
    pub fn quota_pct(&self, user: &UserRow) -> EngineResult<f64> {
        let quota = self.config.quota.quota_for(user.disk_quota_bytes())?;
        Ok(quota_pct(user.disk_usage_bytes(), quota))
    }

    /// Re-sum the user's disk usage, store it, and set every loaded vault of
    /// theirs to the intent their quota allows: upload always, download only
    /// while under quota.
    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn compute_user_disk_usage_and_flock(
        self: &Arc<Self>,
        user: &UserRow,
    ) -> EngineResult<UserUsage> {
        let keys = self
            .metadata
            .list_user_vaults(&user.id)
            .await?
            .iter()
            .map(|row| row.key())
            .collect::<Result<Vec<_>, _>>()?;

        let options = DiskUsageOptions {
            suppress_user_update: true,
            ..Default::default()
        };
        let usages = try_join_all(keys.iter().map(|key| self.get_disk_usage(key, options))).await?;
        let disk_usage: u64 = usages.iter().sum();
        self.metadata
            .update_user_disk_usage(&user.id, disk_usage)
            .await?;

        let disk_quota = self.config.quota.quota_for(user.disk_quota_bytes())?;
        let pct = quota_pct(disk_usage, disk_quota);
        let intent = FlockIntent::for_quota(pct);
        for key in &keys {
            if let Some(handle) = self.registry.get(key) {
                self.set_flock_intent(&handle, intent).await?;
            }
        }

        debug!(disk_usage, disk_quota, quota_pct = pct, "User disk usage recomputed");
        Ok(UserUsage {
            disk_usage,
            disk_quota,
            quota_pct: pct,
        })
    }

    /// Recompute one user by id in the background.
    pub(crate) fn spawn_user_recompute(self: &Arc<Self>, user_id: &str) {
        let engine = self.clone();
        let user_id = user_id.to_string();
        self.tasks.spawn_fallible("user-disk-usage", async move {
            if let Some(user) = engine.metadata.get_user(&user_id).await? {
                engine.compute_user_disk_usage_and_flock(&user).await?;
            }
            Ok::<(), EngineError>(())
        });
    }

    /// Recompute every hosting user of `key` in the background.
    fn spawn_owner_recompute(self: &Arc<Self>, key: &VaultKey) {
        let engine = self.clone();
        let key = *key;
        self.tasks.spawn_fallible("owner-disk-usage", async move {
            let Some(record) = engine.metadata.get_vault(&key).await? else {
                return Ok(());
            };
            for user_id in &record.hosting_users {
                if let Some(user) = engine.metadata.get_user(user_id).await? {
                    engine.compute_user_disk_usage_and_flock(&user).await?;
                }
            }
            Ok::<(), EngineError>(())
        });
    }
}
