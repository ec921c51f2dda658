//! Engine test harness over SQLite, temp-dir storage and the in-process
//! archive backend.

use super::fixtures::TEST_BLOCK_SIZE;
use pinfold_archive::{ArchiveBackend, LoopbackProtocol, LoopbackSwarm, MemoryArchive, MemoryOpener};
use pinfold_core::VaultKey;
use pinfold_core::config::{AppConfig, MetadataConfig, StorageConfig};
use pinfold_metadata::{MetadataStore, SqliteStore, UserRow, VaultRow};
use pinfold_server::{AppState, Vaultr, create_router};
use pinfold_storage::VaultStorage;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A running engine with handles on its collaborators.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestEngine {
    pub engine: Arc<Vaultr>,
    pub opener: Arc<MemoryOpener>,
    pub swarm: Arc<LoopbackSwarm>,
    pub storage: Arc<VaultStorage>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestEngine {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Build an engine from the testing config after `customize` edits it.
    pub async fn with_config(customize: impl FnOnce(&mut AppConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");

        let mut config = AppConfig::for_testing();
        config.storage = StorageConfig {
            data_dir: temp_dir.path().join("data"),
        };
        config.metadata = MetadataConfig::Sqlite {
            path: temp_dir.path().join("metadata.db"),
            query_timeout_secs: None,
        };
        customize(&mut config);

        let storage = Arc::new(
            VaultStorage::new(&config.storage.data_dir)
                .await
                .expect("Failed to create vault storage"),
        );
        let db_path = temp_dir.path().join("metadata.db");
        let metadata: Arc<dyn MetadataStore> = Arc::new(
            SqliteStore::new(&db_path, None)
                .await
                .expect("Failed to create metadata store"),
        );

        let opener = Arc::new(MemoryOpener::with_block_size(TEST_BLOCK_SIZE));
        let swarm = Arc::new(LoopbackSwarm::new());
        let archives = ArchiveBackend {
            opener: opener.clone(),
            swarm: swarm.clone(),
            protocol: Arc::new(LoopbackProtocol),
        };

        let engine = Vaultr::new(Arc::new(config), metadata, storage.clone(), archives);

        Self {
            engine,
            opener,
            swarm,
            storage,
            _temp_dir: temp_dir,
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        self.engine.metadata()
    }

    /// Router over this engine.
    pub fn router(&self) -> axum::Router {
        create_router(AppState::new(self.engine.clone()))
    }

    /// Create a user with an optional quota override in bytes.
    pub async fn create_user(&self, id: &str, quota: Option<u64>) -> UserRow {
        let user = UserRow::new(id, format!("{id}-name"));
        self.metadata().create_user(&user).await.unwrap();
        if quota.is_some() {
            self.metadata().set_user_disk_quota(id, quota).await.unwrap();
        }
        self.metadata().get_user(id).await.unwrap().unwrap()
    }

    pub async fn user(&self, id: &str) -> UserRow {
        self.metadata().get_user(id).await.unwrap().unwrap()
    }

    /// Host `key` for `user_id`, which also loads it.
    pub async fn host(&self, user_id: &str, key: &VaultKey) -> VaultRow {
        self.engine
            .add_hosted_vault(user_id, key, Some("test vault"))
            .await
            .unwrap()
    }

    /// The archive instance the engine opened for `key`.
    pub fn archive(&self, key: &VaultKey) -> Arc<MemoryArchive> {
        self.opener.archive(key).expect("archive was never opened")
    }

    /// Wait for every background task the engine spawned.
    pub async fn settle(&self) {
        self.engine.tasks().wait_idle().await;
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
