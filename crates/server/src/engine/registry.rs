//! Loaded-vault registry: load, close and lookups.
//!
//! Concurrent loads of one key share a single in-flight future. The load
//! itself runs as its own task, so it completes and is registered even when
//! every caller stops waiting for it.

use super::accounting::DiskUsageOptions;
use super::error::{EngineError, EngineResult};
use super::handle::VaultHandle;
use super::throttle::Throttle;
use super::Vaultr;
use crate::metrics::{REPLICATION_STREAMS_ACTIVE, VAULT_LOADS, VAULTS_LOADED};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use pinfold_archive::{Archive, OpenOptions};
use pinfold_core::{DiscoveryKey, FlockIntent, VaultKey, VaultStats};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

type LoadResult = Result<Arc<VaultHandle>, Arc<EngineError>>;
type PendingLoad = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Default)]
pub(crate) struct Registry {
    by_key: DashMap<VaultKey, Arc<VaultHandle>>,
    by_discovery: DashMap<DiscoveryKey, Arc<VaultHandle>>,
    loading: DashMap<VaultKey, PendingLoad>,
}

impl Registry {
    pub(crate) fn get(&self, key: &VaultKey) -> Option<Arc<VaultHandle>> {
        self.by_key.get(key).map(|entry| entry.clone())
    }

    pub(crate) fn get_by_discovery(&self, key: &DiscoveryKey) -> Option<Arc<VaultHandle>> {
        self.by_discovery.get(key).map(|entry| entry.clone())
    }

    fn pending(&self, key: &VaultKey) -> Option<PendingLoad> {
        self.loading.get(key).map(|entry| entry.clone())
    }

    pub(crate) fn is_loading(&self, key: &VaultKey) -> bool {
        self.loading.contains_key(key)
    }

    fn insert(&self, handle: Arc<VaultHandle>) {
        self.by_discovery
            .insert(*handle.discovery_key(), handle.clone());
        self.by_key.insert(*handle.key(), handle);
    }

    /// Remove `handle` from both maps unless another instance replaced it.
    fn remove(&self, handle: &Arc<VaultHandle>) -> bool {
        self.by_discovery
            .remove_if(handle.discovery_key(), |_, current| Arc::ptr_eq(current, handle));
        self.by_key
            .remove_if(handle.key(), |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    pub(crate) fn handles(&self) -> Vec<Arc<VaultHandle>> {
        self.by_key.iter().map(|entry| entry.value().clone()).collect()
    }

    fn keys(&self) -> Vec<VaultKey> {
        let mut keys: Vec<VaultKey> = self.by_key.iter().map(|entry| *entry.key()).collect();
        keys.extend(self.loading.iter().map(|entry| *entry.key()));
        keys.sort_unstable();
        keys.dedup();
        keys
    }
}

impl Vaultr {
    /// Load `key`, or join the load already in flight for it.
    ///
    /// A failed load is not remembered; the next call starts over.
    pub async fn load_vault(self: &Arc<Self>, key: &VaultKey) -> EngineResult<Arc<VaultHandle>> {
        if let Some(handle) = self.registry.get(key) {
            return Ok(handle);
        }

        let pending = match self.registry.loading.entry(*key) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                // The previous load may have finished since the lookup above.
                if let Some(handle) = self.registry.get(key) {
                    return Ok(handle);
                }
                let pending = self.spawn_load(*key);
                entry.insert(pending.clone());
                pending
            }
        };

        pending.await.map_err(|source| EngineError::Load {
            key: key.to_hex(),
            source,
        })
    }

    fn spawn_load(self: &Arc<Self>, key: VaultKey) -> PendingLoad {
        let engine = self.clone();
        let task = tokio::spawn(async move {
            let result = engine.open_vault(&key).await;
            match &result {
                Ok(handle) => {
                    engine.registry.insert(handle.clone());
                    VAULTS_LOADED.inc();
                    VAULT_LOADS.with_label_values(&["ok"]).inc();
                    info!(vault = %key, "Vault loaded");
                }
                Err(e) => {
                    VAULT_LOADS.with_label_values(&["error"]).inc();
                    warn!(vault = %key, error = %e, "Vault load failed");
                }
            }
            engine.registry.loading.remove(&key);
            result.map_err(Arc::new)
        });

        let engine = Arc::downgrade(self);
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_err) => {
                    if let Some(engine) = engine.upgrade() {
                        engine.registry.loading.remove(&key);
                    }
                    Err(Arc::new(EngineError::Task(join_err.to_string())))
                }
            }
        }
        .boxed()
        .shared()
    }

    #[instrument(skip_all, fields(vault = %key))]
    async fn open_vault(self: &Arc<Self>, key: &VaultKey) -> EngineResult<Arc<VaultHandle>> {
        let path = self.storage.ensure_dir(key).await?;
        let archive = self
            .archives
            .opener
            .open(&path, key, OpenOptions::from(&self.config.archive.cache))
            .await?;

        match self.attach_archive(archive.clone()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if let Err(close_err) = archive.close().await {
                    warn!(error = %close_err, "Failed to close archive after failed load");
                }
                Err(e)
            }
        }
    }

    async fn attach_archive(
        self: &Arc<Self>,
        archive: Arc<dyn Archive>,
    ) -> EngineResult<Arc<VaultHandle>> {
        archive.ready().await?;

        let (stats, disk_usage) = match self.metadata.get_vault(&archive.key()).await? {
            Some(record) => (record.stats(), record.disk_usage_bytes()),
            None => (VaultStats::default(), None),
        };
        let handle = Arc::new(VaultHandle::new(archive, stats, disk_usage));
        self.watch_downloads(&handle);

        if stats.num_blocks == 0 {
            debug!("No cached stats, computing");
            if let Err(e) = self.recompute_stats(&handle).await {
                warn!(error = %e, "Initial stats computation failed");
            }
        }
        Ok(handle)
    }

    /// Refresh disk usage and stats, throttled, whenever the archive
    /// downloads blocks.
    fn watch_downloads(self: &Arc<Self>, handle: &Arc<VaultHandle>) {
        let engine = Arc::downgrade(self);
        let target = Arc::downgrade(handle);
        let throttle = Throttle::new(
            "refresh-vault",
            self.config.archive.stats_throttle(),
            self.tasks.clone(),
            move || {
                let engine = engine.upgrade();
                let handle = target.upgrade();
                async move {
                    let (Some(engine), Some(handle)) = (engine, handle) else {
                        return;
                    };
                    if !handle.closing().is_cancelled() {
                        engine.refresh_vault(&handle).await;
                    }
                }
            },
        );

        let mut downloads = handle.archive().subscribe_downloads();
        let closing = handle.closing().clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closing.cancelled() => break,
                    event = downloads.recv() => match event {
                        Ok(_) | Err(RecvError::Lagged(_)) => throttle.trigger(),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn refresh_vault(self: &Arc<Self>, handle: &Arc<VaultHandle>) {
        if let Err(e) = self
            .get_disk_usage(handle.key(), DiskUsageOptions::forced())
            .await
        {
            warn!(vault = %handle.key(), error = %e, "Disk usage refresh failed");
        }
        if let Err(e) = self.recompute_stats(handle).await {
            warn!(vault = %handle.key(), error = %e, "Stats refresh failed");
        }
    }

    /// Close `key`. Closing a vault that is not loaded is a no-op; a vault
    /// that is still loading is closed once the load settles.
    pub async fn close_vault(&self, key: &VaultKey) -> EngineResult<()> {
        loop {
            if let Some(handle) = self.registry.get(key) {
                return self.close_handle(&handle).await;
            }
            match self.registry.pending(key) {
                Some(pending) => {
                    let _ = pending.await;
                }
                None => return Ok(()),
            }
        }
    }

    async fn close_handle(&self, handle: &Arc<VaultHandle>) -> EngineResult<()> {
        let key = *handle.key();
        // New stream attachments stop before the stream set is drained.
        handle.closing().cancel();
        if let Err(e) = self.set_flock_intent(handle, FlockIntent::DORMANT).await {
            warn!(vault = %key, error = %e, "Failed to leave swarm while closing");
        }
        for stream in handle.take_streams() {
            stream.destroy();
            REPLICATION_STREAMS_ACTIVE.dec();
        }

        let closed = handle.archive().close().await;
        if self.registry.remove(handle) {
            self.progress.close(&key);
            VAULTS_LOADED.dec();
            info!(vault = %key, "Vault closed");
        }
        closed.map_err(Into::into)
    }

    /// Close every loaded or loading vault.
    pub async fn close_all(&self) {
        let keys = self.registry.keys();
        let results =
            futures::future::join_all(keys.iter().map(|key| self.close_vault(key))).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                warn!(vault = %key, error = %e, "Failed to close vault");
            }
        }
        info!(count = keys.len(), "Closed all vaults");
    }

    /// The loaded handle for `key`, without loading it.
    pub fn get_vault(&self, key: &VaultKey) -> Option<Arc<VaultHandle>> {
        self.registry.get(key)
    }

    pub fn is_loading(&self, key: &VaultKey) -> bool {
        self.registry.is_loading(key)
    }

    pub fn loaded_vaults(&self) -> Vec<Arc<VaultHandle>> {
        self.registry.handles()
    }

    /// Load every recorded vault, then bring quotas and the popular index up
    /// to date. Individual load failures are logged and skipped.
    pub async fn load_all_vaults(self: &Arc<Self>) -> EngineResult<()> {
        let keys = self.metadata.list_vault_keys().await?;
        info!(count = keys.len(), "Loading vaults");

        let results =
            futures::future::join_all(keys.iter().map(|key| self.load_vault(key))).await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        info!(loaded = keys.len() - failed, failed, "Vaults loaded");

        self.compute_all_user_disk_usage_and_flock().await?;
        self.compute_popular_index().await?;
        Ok(())
    }
}
