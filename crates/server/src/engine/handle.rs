//! Runtime state of one loaded vault.

use pinfold_archive::{Archive, ReplicationStream};
use pinfold_core::{DiscoveryKey, FlockIntent, VaultKey, VaultStats};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct HandleState {
    flock: Option<FlockIntent>,
    streams: Vec<Arc<dyn ReplicationStream>>,
    stats: VaultStats,
    disk_usage: Option<u64>,
    manifest: Option<CachedManifest>,
}

/// Manifest document and the content offset it was read at.
#[derive(Clone, Debug)]
pub(crate) struct CachedManifest {
    pub offset: u64,
    pub document: Value,
}

/// Outcome of a flock transition that changed something.
pub(crate) struct Transition {
    /// The vault was in the swarm and must leave it.
    pub was_flocking: bool,
    /// Streams detached from the vault, to be destroyed by the caller.
    pub detached: Vec<Arc<dyn ReplicationStream>>,
}

/// A loaded vault. Owned by the registry; everyone else holds clones of the
/// `Arc`.
///
/// The state mutex is a plain `std` mutex and is never held across an
/// `.await`.
pub struct VaultHandle {
    key: VaultKey,
    discovery_key: DiscoveryKey,
    archive: Arc<dyn Archive>,
    state: Mutex<HandleState>,
    /// Serializes flock transitions together with their swarm calls.
    flock_serial: tokio::sync::Mutex<()>,
    closing: CancellationToken,
}

impl VaultHandle {
    pub(crate) fn new(
        archive: Arc<dyn Archive>,
        stats: VaultStats,
        disk_usage: Option<u64>,
    ) -> Self {
        Self {
            key: archive.key(),
            discovery_key: archive.discovery_key(),
            archive,
            state: Mutex::new(HandleState {
                stats,
                disk_usage,
                ..Default::default()
            }),
            flock_serial: tokio::sync::Mutex::new(()),
            closing: CancellationToken::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(vault = %self.key, "vault state mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn key(&self) -> &VaultKey {
        &self.key
    }

    pub fn discovery_key(&self) -> &DiscoveryKey {
        &self.discovery_key
    }

    pub fn archive(&self) -> &Arc<dyn Archive> {
        &self.archive
    }

    /// Current swarm participation, `None` when not flocking.
    pub fn flock_intent(&self) -> Option<FlockIntent> {
        self.state().flock
    }

    /// Forget the recorded intent after a swarm call failed, so the next
    /// transition retries from scratch.
    pub(crate) fn clear_flock(&self) {
        self.state().flock = None;
    }

    pub(crate) async fn lock_flock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.flock_serial.lock().await
    }

    /// Switch to `intent` in one step. Returns `None` when nothing changes.
    ///
    /// Leaving the swarm detaches every stream. A dormant intent leaves the
    /// vault with no recorded flock state.
    pub(crate) fn transition(&self, intent: FlockIntent) -> Option<Transition> {
        let mut state = self.state();
        match state.flock {
            Some(current) if current == intent => return None,
            None if intent.is_dormant() => return None,
            _ => {}
        }

        let was_flocking = state.flock.is_some();
        let detached = if was_flocking {
            std::mem::take(&mut state.streams)
        } else {
            Vec::new()
        };
        state.flock = (!intent.is_dormant()).then_some(intent);

        Some(Transition {
            was_flocking,
            detached,
        })
    }

    /// Register a stream. Returns `false` if it was already registered.
    pub(crate) fn add_stream(&self, stream: Arc<dyn ReplicationStream>) -> bool {
        let mut state = self.state();
        if state.streams.iter().any(|s| s.id() == stream.id()) {
            return false;
        }
        state.streams.push(stream);
        true
    }

    pub fn has_stream(&self, stream_id: u64) -> bool {
        self.state().streams.iter().any(|s| s.id() == stream_id)
    }

    pub(crate) fn remove_stream(&self, stream_id: u64) -> bool {
        let mut state = self.state();
        let before = state.streams.len();
        state.streams.retain(|s| s.id() != stream_id);
        state.streams.len() != before
    }

    pub(crate) fn take_streams(&self) -> Vec<Arc<dyn ReplicationStream>> {
        std::mem::take(&mut self.state().streams)
    }

    pub fn num_streams(&self) -> usize {
        self.state().streams.len()
    }

    pub fn stats(&self) -> VaultStats {
        self.state().stats
    }

    pub(crate) fn set_stats(&self, stats: VaultStats) {
        self.state().stats = stats;
    }

    pub fn disk_usage(&self) -> Option<u64> {
        self.state().disk_usage
    }

    pub(crate) fn set_disk_usage(&self, bytes: u64) {
        self.state().disk_usage = Some(bytes);
    }

    pub(crate) fn cached_manifest(&self) -> Option<CachedManifest> {
        self.state().manifest.clone()
    }

    pub(crate) fn cache_manifest(&self, manifest: CachedManifest) {
        self.state().manifest = Some(manifest);
    }

    /// Cancelled when the vault starts closing. Watchers spawned for the
    /// vault stop on it.
    pub(crate) fn closing(&self) -> &CancellationToken {
        &self.closing
    }
}

impl std::fmt::Debug for VaultHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultHandle")
            .field("key", &self.key)
            .field("flock", &self.flock_intent())
            .field("streams", &self.num_streams())
            .finish_non_exhaustive()
    }
}
