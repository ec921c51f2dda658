//! Archive error types.

use thiserror::Error;

/// Archive and transport errors.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("entry not found: {0}")]
    NotFound(String),

    /// Data exists in the archive but its blocks are not stored locally yet.
    #[error("not available locally: {0}")]
    NotAvailable(String),

    #[error("archive not ready")]
    NotReady,

    #[error("archive closed")]
    Closed,

    #[error("failed to open archive: {0}")]
    Open(String),

    #[error("invalid version {requested} (latest is {latest})")]
    InvalidVersion { requested: u64, latest: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for archive operations.
pub type ArchiveResult<T> = std::result::Result<T, ArchiveError>;
