//! Archive, swarm and protocol trait definitions.

use crate::error::ArchiveResult;
use async_trait::async_trait;
use bytes::Bytes;
use pinfold_core::config::CacheConfig;
use pinfold_core::{DiscoveryKey, VaultKey};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

/// Cache sizes passed to the archive implementation on open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenOptions {
    pub metadata_cache: usize,
    pub content_cache: usize,
    pub tree_cache: usize,
}

impl From<&CacheConfig> for OpenOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            metadata_cache: config.metadata_blocks,
            content_cache: config.content_blocks,
            tree_cache: config.tree_nodes,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Stat of one entry in a version of the file tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryStat {
    pub kind: EntryKind,
    /// File size in bytes; 0 for directories.
    pub size: u64,
    /// Number of content blocks the file spans.
    pub blocks: u64,
    /// Index of the file's first block in the content feed.
    pub offset: u64,
}

impl EntryStat {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// A content block became available locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownloadEvent {
    pub index: u64,
}

/// Direction and lifetime of a replication attachment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicateOptions {
    pub upload: bool,
    pub download: bool,
    /// Keep replicating new data until the stream closes.
    pub live: bool,
}

/// A version-pinned, read-only view of an archive's file tree.
#[async_trait]
pub trait Checkout: Send + Sync {
    /// Version this view is pinned to.
    fn version(&self) -> u64;

    /// Names of the direct children of the directory at `path`.
    async fn readdir(&self, path: &str) -> ArchiveResult<Vec<String>>;

    async fn stat(&self, path: &str) -> ArchiveResult<EntryStat>;

    /// Read a whole file from locally stored blocks only.
    async fn read_file(&self, path: &str) -> ArchiveResult<Bytes>;
}

/// An open archive. As a [`Checkout`] it reads the latest version.
#[async_trait]
pub trait Archive: Checkout {
    fn key(&self) -> VaultKey;

    fn discovery_key(&self) -> DiscoveryKey;

    /// Resolve once the archive has loaded its local state.
    async fn ready(&self) -> ArchiveResult<()>;

    /// Both the metadata and content sub-stores are ready.
    fn is_ready(&self) -> bool;

    /// Pin a view to `version`.
    fn checkout(&self, version: u64) -> ArchiveResult<Arc<dyn Checkout>>;

    /// Whether content block `index` is stored locally.
    fn has_block(&self, index: u64) -> bool;

    /// Remote peers currently replicating this archive's metadata.
    fn num_remote_peers(&self) -> usize;

    /// Signal fired for each content block downloaded.
    fn subscribe_downloads(&self) -> broadcast::Receiver<DownloadEvent>;

    /// Attach a replication stream to this archive.
    fn replicate(
        &self,
        stream: Arc<dyn ReplicationStream>,
        options: ReplicateOptions,
    ) -> ArchiveResult<()>;

    /// Flush and release the archive.
    async fn close(&self) -> ArchiveResult<()>;
}

/// Opens archives stored in a vault directory.
#[async_trait]
pub trait ArchiveOpener: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        key: &VaultKey,
        options: OpenOptions,
    ) -> ArchiveResult<Arc<dyn Archive>>;
}

/// Identity of a remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub address: Option<String>,
}

/// Byte transport of a peer connection.
pub trait ConnectionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ConnectionIo for T {}

/// Raw inbound connection handed out by the swarm.
pub struct PeerConnection {
    pub info: PeerInfo,
    pub io: Box<dyn ConnectionIo>,
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Peer discovery: announce interest in discovery keys and accept connections.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Join the channel for `key`, making this node discoverable for it.
    async fn listen(&self, key: &DiscoveryKey) -> ArchiveResult<()>;

    /// Leave the channel for `key`.
    async fn leave(&self, key: &DiscoveryKey) -> ArchiveResult<()>;

    /// Next inbound connection, or `None` once the swarm is shut down.
    async fn accept(&self) -> Option<PeerConnection>;
}

/// Options for a protocol stream.
#[derive(Clone, Copy, Debug)]
pub struct StreamOptions {
    /// Process-local stream identifier.
    pub id: u64,
    /// Identity of this node on the network.
    pub network_id: [u8; 32],
    pub live: bool,
    pub encrypt: bool,
}

/// Events raised by a protocol stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Handshake,
    /// The peer asked to replicate the archive with this discovery key.
    Feed(DiscoveryKey),
    Error(String),
    /// Terminal: the stream is closed.
    Close,
}

/// A live, full-duplex replication stream over one connection. One stream
/// can carry several archives.
#[async_trait]
pub trait ReplicationStream: Send + Sync {
    fn id(&self) -> u64;

    fn peer(&self) -> &PeerInfo;

    /// Tear the stream down. Idempotent.
    fn destroy(&self);

    fn is_closed(&self) -> bool;

    /// Resolve once the stream is closed, whichever side closed it.
    async fn closed(&self);
}

/// A stream plus its event feed.
pub struct ProtocolSession {
    pub stream: Arc<dyn ReplicationStream>,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

/// Wraps raw connections in replication streams.
pub trait Protocol: Send + Sync {
    fn open(&self, connection: PeerConnection, options: StreamOptions) -> ProtocolSession;
}
