//! Vault replication and quota-governed flocking engine.
//!
//! [`Vaultr`] owns every loaded vault. It is shared as `Arc<Vaultr>` between
//! HTTP handlers, the replication multiplexer, the job scheduler and the
//! detached tasks they spawn. Operations are split by concern:
//!
//! - [`registry`]: load and close with in-flight deduplication
//! - [`flock`]: swarm participation per vault
//! - [`accounting`]: disk usage and per-user quota recomputation
//! - [`replication`]: inbound peer connections and replication streams
//! - [`stats`]: block-level download statistics
//! - [`jobs`]: periodic maintenance under the job lock
//! - [`hosting`]: user/vault hosting transactions
//! - [`manifest`] and [`info`]: read-side views for the HTTP layer

pub mod accounting;
pub mod error;
pub mod flock;
pub mod handle;
pub mod hosting;
pub mod info;
pub mod jobs;
pub mod manifest;
pub mod progress;
pub mod registry;
pub mod replication;
pub mod stats;
pub mod tasks;
pub mod throttle;

pub use accounting::{DiskUsageOptions, UserUsage};
pub use error::{EngineError, EngineResult};
pub use handle::VaultHandle;
pub use info::{VaultInfo, VaultStatus};
pub use jobs::{Job, JobReport, PopularEntry};
pub use progress::ProgressHub;
pub use replication::ConnectionEvent;
pub use tasks::{TaskCounts, TaskTracker};

use pinfold_archive::ArchiveBackend;
use pinfold_core::LockTable;
use pinfold_core::config::AppConfig;
use pinfold_metadata::MetadataStore;
use pinfold_storage::VaultStorage;
use rand::RngCore;
use registry::Registry;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const CONNECTION_EVENT_CAPACITY: usize = 256;

/// The hosting node's vault engine.
pub struct Vaultr {
    config: Arc<AppConfig>,
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<VaultStorage>,
    archives: ArchiveBackend,
    locks: LockTable,
    registry: Registry,
    progress: ProgressHub,
    tasks: TaskTracker,
    popular: RwLock<Vec<PopularEntry>>,
    /// Identity presented to peers on every replication stream.
    network_id: [u8; 32],
    connections: broadcast::Sender<ConnectionEvent>,
    next_stream_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Vaultr {
    pub fn new(
        config: Arc<AppConfig>,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<VaultStorage>,
        archives: ArchiveBackend,
    ) -> Arc<Self> {
        let mut network_id = [0u8; 32];
        rand::rng().fill_bytes(&mut network_id);
        let (connections, _) = broadcast::channel(CONNECTION_EVENT_CAPACITY);

        Arc::new(Self {
            config,
            metadata,
            storage,
            archives,
            locks: LockTable::new(),
            registry: Registry::default(),
            progress: ProgressHub::new(),
            tasks: TaskTracker::new(),
            popular: RwLock::new(Vec::new()),
            network_id,
            connections,
            next_stream_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn storage(&self) -> &Arc<VaultStorage> {
        &self.storage
    }

    /// Named locks shared by hosting transactions, jobs and stats.
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    /// Tracker for the engine's detached background work.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn network_id(&self) -> &[u8; 32] {
        &self.network_id
    }

    /// Observe peer connection lifecycle events.
    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    /// Stop the multiplexer accept loop and the job scheduler. Loaded vaults
    /// stay open until [`Vaultr::close_all`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
