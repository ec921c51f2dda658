//! Engine error types.

use pinfold_archive::ArchiveError;
use pinfold_metadata::MetadataError;
use pinfold_storage::StorageError;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the replication engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("vault not found: {0}")]
    VaultNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    /// The user is at or over their disk quota.
    #[error("user {user_id} has exceeded their disk usage")]
    OutOfSpace { user_id: String },

    /// A shared load failed. Every caller waiting on it sees the same cause.
    #[error("failed to load vault {key}: {source}")]
    Load {
        key: String,
        #[source]
        source: Arc<EngineError>,
    },

    #[error("task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Core(#[from] pinfold_core::Error),
}

impl EngineError {
    /// Unknown vault, user or record.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::VaultNotFound(_) | Self::UserNotFound(_) => true,
            Self::Metadata(e) => e.is_not_found(),
            Self::Archive(e) => e.is_not_found(),
            Self::Load { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_already_hosted(&self) -> bool {
        matches!(self, Self::Metadata(MetadataError::AlreadyHosted { .. }))
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
