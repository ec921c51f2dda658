//! Archive and swarm transport seam for pinfold.
//!
//! The replication engine never speaks the archive wire protocol itself. It
//! sees archives through the [`Archive`] and [`Checkout`] traits, joins and
//! leaves discovery channels through a [`Swarm`], and turns raw peer
//! connections into replication streams through a [`Protocol`].
//!
//! [`backends::memory`] and [`backends::loopback`] implement the seam
//! in-process: archives keep downloaded blocks on disk under the vault
//! directory, and peers talk a small line protocol over in-memory pipes.

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::loopback::{LoopbackProtocol, LoopbackSwarm, RemotePeer};
pub use backends::memory::{MemoryArchive, MemoryFile, MemoryOpener};
pub use error::{ArchiveError, ArchiveResult};
pub use traits::{
    Archive, ArchiveOpener, Checkout, ConnectionIo, DownloadEvent, EntryKind, EntryStat,
    OpenOptions, PeerConnection, PeerInfo, Protocol, ProtocolSession, ReplicateOptions,
    ReplicationStream, StreamEvent, StreamOptions, Swarm,
};

use pinfold_core::config::{ArchiveBackendConfig, ArchiveConfig};
use std::sync::Arc;

/// The three collaborators the engine needs from an archive implementation.
#[derive(Clone)]
pub struct ArchiveBackend {
    pub opener: Arc<dyn ArchiveOpener>,
    pub swarm: Arc<dyn Swarm>,
    pub protocol: Arc<dyn Protocol>,
}

/// Build the archive backend selected in configuration.
pub fn from_config(config: &ArchiveConfig) -> ArchiveBackend {
    match config.backend {
        ArchiveBackendConfig::Memory => {
            tracing::info!("Using in-memory archive backend with loopback swarm");
            ArchiveBackend {
                opener: Arc::new(MemoryOpener::new()),
                swarm: Arc::new(LoopbackSwarm::new()),
                protocol: Arc::new(LoopbackProtocol),
            }
        }
    }
}
