//! Read-side views of vault state.

use super::accounting::DiskUsageOptions;
use super::error::{EngineError, EngineResult};
use super::Vaultr;
use pinfold_core::{FlockIntent, VaultKey, VaultStats};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Everything known about one vault.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultInfo {
    pub key: VaultKey,
    pub num_peers: usize,
    pub manifest: Option<Value>,
    pub flock_intent: Option<FlockIntent>,
    pub disk_usage: u64,
    pub progress: f64,
    pub is_loading: bool,
    pub stats: VaultStats,
    pub num_streams: usize,
}

/// Compact status for public polling.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStatus {
    pub key: VaultKey,
    pub progress: f64,
    pub disk_usage: u64,
    pub num_peers: usize,
    pub is_loading: bool,
}

impl Vaultr {
    /// Fraction of the newest version stored locally. 0 when not loaded.
    pub fn get_download_progress(&self, key: &VaultKey) -> f64 {
        self.registry
            .get(key)
            .map(|handle| handle.stats().progress())
            .unwrap_or(0.0)
    }

    pub fn is_fully_downloaded(&self, key: &VaultKey) -> bool {
        self.registry
            .get(key)
            .is_some_and(|handle| handle.stats().is_fully_downloaded())
    }

    /// Remote peers plus this node. 0 when not loaded.
    pub fn num_peers(&self, key: &VaultKey) -> usize {
        self.registry
            .get(key)
            .map(|handle| handle.archive().num_remote_peers() + 1)
            .unwrap_or(0)
    }

    /// Last modification of the vault directory in milliseconds since the
    /// epoch, 0 when it cannot be read.
    pub async fn get_vault_mtime(&self, key: &VaultKey) -> u64 {
        match self.storage.mtime(key).await {
            Ok(mtime) => mtime,
            Err(e) => {
                debug!(vault = %key, error = %e, "Vault mtime unavailable");
                0
            }
        }
    }

    fn ensure_known(&self, key: &VaultKey) -> EngineResult<()> {
        if self.registry.get(key).is_none() && !self.registry.is_loading(key) {
            return Err(EngineError::VaultNotFound(key.to_hex()));
        }
        Ok(())
    }

    /// Full view of a loaded or loading vault.
    pub async fn vault_info(self: &Arc<Self>, key: &VaultKey) -> EngineResult<VaultInfo> {
        self.ensure_known(key)?;
        let handle = self.registry.get(key);
        Ok(VaultInfo {
            key: *key,
            num_peers: self.num_peers(key),
            manifest: self.get_manifest(key).await,
            flock_intent: handle.as_ref().and_then(|h| h.flock_intent()),
            disk_usage: self.get_disk_usage(key, DiskUsageOptions::default()).await?,
            progress: self.get_download_progress(key),
            is_loading: self.is_loading(key),
            stats: handle.as_ref().map(|h| h.stats()).unwrap_or_default(),
            num_streams: handle.as_ref().map(|h| h.num_streams()).unwrap_or(0),
        })
    }

    /// Status of a loaded or loading vault.
    pub async fn vault_status(self: &Arc<Self>, key: &VaultKey) -> EngineResult<VaultStatus> {
        self.ensure_known(key)?;
        Ok(VaultStatus {
            key: *key,
            progress: self.get_download_progress(key),
            disk_usage: self.get_disk_usage(key, DiskUsageOptions::default()).await?,
            num_peers: self.num_peers(key),
            is_loading: self.is_loading(key),
        })
    }
}
