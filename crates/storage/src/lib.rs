//! On-disk vault storage for pinfold.
//!
//! Every vault owns one directory under `<data_dir>/vaults`, sharded by the
//! first two hex characters of its key. This crate creates, measures and
//! removes those directories; the archive implementation decides what goes
//! inside them.

pub mod error;
pub mod vaults;

pub use error::{StorageError, StorageResult};
pub use vaults::VaultStorage;

use pinfold_core::config::StorageConfig;
use std::sync::Arc;

/// Create the vault storage from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<VaultStorage>> {
    let storage = VaultStorage::new(&config.data_dir).await?;
    Ok(Arc::new(storage))
}
