//! In-process archive implementation.
//!
//! Remote content is "published" into a shared catalog: an append-only
//! content feed of fixed-size blocks plus one file tree per version. Opening
//! an archive binds it to the catalog entry for its key. Blocks become local
//! only when downloaded, at which point they are written under the vault
//! directory so that disk usage and restarts behave like a real archive.

use crate::error::{ArchiveError, ArchiveResult};
use crate::traits::{
    Archive, ArchiveOpener, Checkout, DownloadEvent, EntryKind, EntryStat, OpenOptions,
    ReplicateOptions, ReplicationStream,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use pinfold_core::{DiscoveryKey, VaultKey};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, instrument};

/// Default content block size.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

const DOWNLOAD_EVENT_CAPACITY: usize = 1024;

/// A file to publish.
#[derive(Clone, Debug)]
pub struct MemoryFile {
    pub path: String,
    pub data: Bytes,
}

impl MemoryFile {
    pub fn new(path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            path: normalize(&path.into()),
            data: data.into(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct FileEntry {
    size: u64,
    offset: u64,
    blocks: u64,
}

/// Published state of one archive.
#[derive(Default)]
struct Catalog {
    /// Content feed.
    blocks: Vec<Bytes>,
    /// `versions[v - 1]` is the tree at version `v`; version 0 is empty.
    versions: Vec<BTreeMap<String, FileEntry>>,
}

impl Catalog {
    fn latest(&self) -> u64 {
        self.versions.len() as u64
    }

    fn tree(&self, version: u64) -> Option<&BTreeMap<String, FileEntry>> {
        match version {
            0 => None,
            v => self.versions.get((v - 1) as usize),
        }
    }
}

type SharedCatalog = Arc<RwLock<Catalog>>;

fn read_catalog(catalog: &SharedCatalog) -> std::sync::RwLockReadGuard<'_, Catalog> {
    catalog.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

// =============================================================================
// Opener
// =============================================================================

/// Opens [`MemoryArchive`]s and holds the published catalog they replicate
/// from.
pub struct MemoryOpener {
    block_size: usize,
    catalogs: DashMap<VaultKey, SharedCatalog>,
    opened: DashMap<VaultKey, Arc<MemoryArchive>>,
    failures: DashMap<VaultKey, String>,
    open_delay_ms: AtomicU64,
    opens: AtomicUsize,
}

impl Default for MemoryOpener {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size: block_size.max(1),
            catalogs: DashMap::new(),
            opened: DashMap::new(),
            failures: DashMap::new(),
            open_delay_ms: AtomicU64::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    fn catalog(&self, key: &VaultKey) -> SharedCatalog {
        self.catalogs.entry(*key).or_default().clone()
    }

    /// Publish a new version of `key` whose tree is exactly `files`. File
    /// content is appended to the content feed. Returns the new version.
    pub fn publish(&self, key: &VaultKey, files: Vec<MemoryFile>) -> u64 {
        let catalog = self.catalog(key);
        let mut catalog = catalog.write().unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut tree = BTreeMap::new();
        for file in files {
            let offset = catalog.blocks.len() as u64;
            let mut blocks = 0u64;
            for chunk in file.data.chunks(self.block_size) {
                catalog.blocks.push(Bytes::copy_from_slice(chunk));
                blocks += 1;
            }
            tree.insert(
                file.path,
                FileEntry {
                    size: file.data.len() as u64,
                    offset,
                    blocks,
                },
            );
        }
        catalog.versions.push(tree);
        catalog.latest()
    }

    /// Make the next open of `key` fail with `reason`.
    pub fn fail_next_open(&self, key: &VaultKey, reason: impl Into<String>) {
        self.failures.insert(*key, reason.into());
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.open_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of opens attempted, including failed ones.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Most recently opened instance for `key`.
    pub fn archive(&self, key: &VaultKey) -> Option<Arc<MemoryArchive>> {
        self.opened.get(key).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ArchiveOpener for MemoryOpener {
    #[instrument(skip(self, options), fields(vault = %key))]
    async fn open(
        &self,
        path: &Path,
        key: &VaultKey,
        options: OpenOptions,
    ) -> ArchiveResult<Arc<dyn Archive>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some((_, reason)) = self.failures.remove(key) {
            return Err(ArchiveError::Open(reason));
        }

        let archive = Arc::new(MemoryArchive::open(path, *key, self.catalog(key), options).await?);
        self.opened.insert(*key, archive.clone());
        Ok(archive)
    }
}

// =============================================================================
// Archive
// =============================================================================

/// A replication attachment recorded by [`MemoryArchive::replicate`].
#[derive(Clone)]
pub struct Attachment {
    pub stream: Arc<dyn ReplicationStream>,
    pub options: ReplicateOptions,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("stream", &self.stream.id())
            .field("options", &self.options)
            .finish()
    }
}

/// Archive bound to a catalog entry, storing downloaded blocks under
/// `<vault dir>/content/<index>`.
pub struct MemoryArchive {
    key: VaultKey,
    discovery_key: DiscoveryKey,
    content_dir: PathBuf,
    catalog: SharedCatalog,
    options: OpenOptions,
    present: Mutex<BTreeSet<u64>>,
    ready: AtomicBool,
    closed: AtomicBool,
    remote_peers: AtomicUsize,
    downloads: broadcast::Sender<DownloadEvent>,
    attachments: Mutex<Vec<Attachment>>,
}

impl MemoryArchive {
    async fn open(
        path: &Path,
        key: VaultKey,
        catalog: SharedCatalog,
        options: OpenOptions,
    ) -> ArchiveResult<Self> {
        let content_dir = path.join("content");
        fs::create_dir_all(&content_dir).await?;
        fs::create_dir_all(path.join("metadata")).await?;
        fs::write(path.join("metadata").join("key"), key.to_hex()).await?;

        // Blocks downloaded by a previous process are still local.
        let mut present = BTreeSet::new();
        let mut entries = fs::read_dir(&content_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            {
                present.insert(index);
            }
        }
        debug!(blocks = present.len(), "Archive opened");

        let (downloads, _) = broadcast::channel(DOWNLOAD_EVENT_CAPACITY);
        Ok(Self {
            key,
            discovery_key: key.discovery_key(),
            content_dir,
            catalog,
            options,
            present: Mutex::new(present),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote_peers: AtomicUsize::new(0),
            downloads,
            attachments: Mutex::new(Vec::new()),
        })
    }

    fn present(&self) -> std::sync::MutexGuard<'_, BTreeSet<u64>> {
        self.present.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_open(&self) -> ArchiveResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ArchiveError::Closed);
        }
        Ok(())
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Total blocks in the content feed.
    pub fn feed_length(&self) -> u64 {
        read_catalog(&self.catalog).blocks.len() as u64
    }

    /// Download content block `index` from the catalog. Returns `false` if
    /// the block was already local.
    pub async fn download_block(&self, index: u64) -> ArchiveResult<bool> {
        self.ensure_open()?;
        if self.has_block(index) {
            return Ok(false);
        }
        let data = read_catalog(&self.catalog)
            .blocks
            .get(index as usize)
            .cloned()
            .ok_or_else(|| ArchiveError::NotFound(format!("block {index}")))?;

        fs::write(self.content_dir.join(index.to_string()), &data).await?;
        let inserted = self.present().insert(index);
        if inserted {
            let _ = self.downloads.send(DownloadEvent { index });
        }
        Ok(inserted)
    }

    /// Download every block that is not yet local. Returns how many were
    /// fetched.
    pub async fn download_all(&self) -> ArchiveResult<u64> {
        let mut fetched = 0;
        for index in 0..self.feed_length() {
            if self.download_block(index).await? {
                fetched += 1;
            }
        }
        Ok(fetched)
    }

    pub fn set_remote_peers(&self, peers: usize) {
        self.remote_peers.store(peers, Ordering::SeqCst);
    }

    /// Replication attachments made so far, in order.
    pub fn attachments(&self) -> Vec<Attachment> {
        self.attachments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn view(&self, version: u64) -> MemoryCheckout {
        MemoryCheckout {
            catalog: self.catalog.clone(),
            content_dir: self.content_dir.clone(),
            version,
        }
    }

    fn latest(&self) -> u64 {
        read_catalog(&self.catalog).latest()
    }
}

#[async_trait]
impl Checkout for MemoryArchive {
    fn version(&self) -> u64 {
        self.latest()
    }

    async fn readdir(&self, path: &str) -> ArchiveResult<Vec<String>> {
        self.ensure_open()?;
        self.view(self.latest()).readdir(path).await
    }

    async fn stat(&self, path: &str) -> ArchiveResult<EntryStat> {
        self.ensure_open()?;
        self.view(self.latest()).stat(path).await
    }

    async fn read_file(&self, path: &str) -> ArchiveResult<Bytes> {
        self.ensure_open()?;
        self.view(self.latest()).read_file(path).await
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    fn key(&self) -> VaultKey {
        self.key
    }

    fn discovery_key(&self) -> DiscoveryKey {
        self.discovery_key
    }

    async fn ready(&self) -> ArchiveResult<()> {
        self.ensure_open()?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn checkout(&self, version: u64) -> ArchiveResult<Arc<dyn Checkout>> {
        self.ensure_open()?;
        let latest = self.latest();
        if version > latest {
            return Err(ArchiveError::InvalidVersion {
                requested: version,
                latest,
            });
        }
        Ok(Arc::new(self.view(version)))
    }

    fn has_block(&self, index: u64) -> bool {
        self.present().contains(&index)
    }

    fn num_remote_peers(&self) -> usize {
        self.remote_peers.load(Ordering::SeqCst)
    }

    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent> {
        self.downloads.subscribe()
    }

    fn replicate(
        &self,
        stream: Arc<dyn ReplicationStream>,
        options: ReplicateOptions,
    ) -> ArchiveResult<()> {
        self.ensure_open()?;
        if stream.is_closed() {
            return Err(ArchiveError::Protocol(format!(
                "stream {} is already closed",
                stream.id()
            )));
        }
        self.attachments
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Attachment { stream, options });
        Ok(())
    }

    async fn close(&self) -> ArchiveResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);
        debug!(vault = %self.key, "Archive closed");
        Ok(())
    }
}

// =============================================================================
// Checkout
// =============================================================================

/// Version-pinned view over the catalog.
pub struct MemoryCheckout {
    catalog: SharedCatalog,
    content_dir: PathBuf,
    version: u64,
}

impl MemoryCheckout {
    fn entry(&self, path: &str) -> Option<FileEntry> {
        let catalog = read_catalog(&self.catalog);
        catalog
            .tree(self.version)
            .and_then(|tree| tree.get(&normalize(path)).copied())
    }
}

#[async_trait]
impl Checkout for MemoryCheckout {
    fn version(&self) -> u64 {
        self.version
    }

    async fn readdir(&self, path: &str) -> ArchiveResult<Vec<String>> {
        let dir = normalize(path);
        let prefix = if dir == "/" { dir.clone() } else { format!("{dir}/") };

        let catalog = read_catalog(&self.catalog);
        let Some(tree) = catalog.tree(self.version) else {
            return if dir == "/" {
                Ok(Vec::new())
            } else {
                Err(ArchiveError::NotFound(dir))
            };
        };

        let names: BTreeSet<String> = tree
            .keys()
            .filter_map(|file| file.strip_prefix(&prefix))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();

        if names.is_empty() && dir != "/" {
            return Err(ArchiveError::NotFound(dir));
        }
        Ok(names.into_iter().collect())
    }

    async fn stat(&self, path: &str) -> ArchiveResult<EntryStat> {
        if let Some(entry) = self.entry(path) {
            return Ok(EntryStat {
                kind: EntryKind::File,
                size: entry.size,
                blocks: entry.blocks,
                offset: entry.offset,
            });
        }

        let dir = normalize(path);
        let is_dir = dir == "/" || {
            let prefix = format!("{dir}/");
            let catalog = read_catalog(&self.catalog);
            catalog
                .tree(self.version)
                .is_some_and(|tree| tree.keys().any(|file| file.starts_with(&prefix)))
        };
        if is_dir {
            Ok(EntryStat {
                kind: EntryKind::Directory,
                size: 0,
                blocks: 0,
                offset: 0,
            })
        } else {
            Err(ArchiveError::NotFound(dir))
        }
    }

    async fn read_file(&self, path: &str) -> ArchiveResult<Bytes> {
        let entry = self
            .entry(path)
            .ok_or_else(|| ArchiveError::NotFound(normalize(path)))?;

        let mut data = BytesMut::with_capacity(entry.size as usize);
        for index in entry.offset..entry.offset + entry.blocks {
            match fs::read(self.content_dir.join(index.to_string())).await {
                Ok(block) => data.extend_from_slice(&block),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ArchiveError::NotAvailable(format!(
                        "{} (block {index})",
                        normalize(path)
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(data.freeze())
    }
}
