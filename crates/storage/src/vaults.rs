//! Per-vault directory management.

use crate::error::{StorageError, StorageResult};
use pinfold_core::VaultKey;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use tracing::instrument;

/// Vault directory layout rooted at `<data_dir>/vaults`.
pub struct VaultStorage {
    root: PathBuf,
}

impl VaultStorage {
    /// Create the storage, making sure the vault root exists.
    pub async fn new(data_dir: impl AsRef<Path>) -> StorageResult<Self> {
        let root = data_dir.as_ref().join("vaults");
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding `key`'s data: `vaults/<key[0..2]>/<key[2..]>`.
    pub fn vault_path(&self, key: &VaultKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    /// Create the vault directory if missing and return its path.
    #[instrument(skip(self), fields(vault = %key))]
    pub async fn ensure_dir(&self, key: &VaultKey) -> StorageResult<PathBuf> {
        let path = self.vault_path(key);
        fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Bytes used by the vault directory. A missing directory uses nothing.
    ///
    /// The walk is blocking filesystem work and runs on the blocking pool;
    /// it can take seconds on large vaults.
    #[instrument(skip(self), fields(vault = %key))]
    pub async fn disk_usage(&self, key: &VaultKey) -> StorageResult<u64> {
        let path = self.vault_path(key);
        tokio::task::spawn_blocking(move || walk_disk_usage(&path))
            .await
            .map_err(|e| StorageError::Join(format!("disk usage walk: {e}")))?
            .map_err(StorageError::Io)
    }

    /// Delete the vault directory and everything in it. Returns `false` when
    /// there was nothing to delete.
    #[instrument(skip(self), fields(vault = %key))]
    pub async fn remove_dir(&self, key: &VaultKey) -> StorageResult<bool> {
        let path = self.vault_path(key);
        match fs::remove_dir_all(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(StorageError::Io(e)),
        }

        // Drop the shard directory once its last vault is gone.
        if let Some(shard) = path.parent() {
            let _ = fs::remove_dir(shard).await;
        }
        Ok(true)
    }

    /// Last modification time of the vault directory in milliseconds since
    /// the Unix epoch, or 0 when the directory does not exist.
    pub async fn mtime(&self, key: &VaultKey) -> StorageResult<u64> {
        let path = self.vault_path(key);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let millis = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Ok(millis)
    }

    /// Verify the vault root is still a writable directory.
    pub async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(StorageError::InvalidPath(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        if metadata.permissions().readonly() {
            return Err(StorageError::InvalidPath(format!(
                "{} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }
}

/// Sum file sizes under `root`. Symlinks are not followed and entries that
/// disappear mid-walk are skipped.
fn walk_disk_usage(root: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let metadata = match std::fs::symlink_metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else if metadata.is_file() {
                total = total.saturating_add(metadata.len());
            }
        }
    }

    Ok(total)
}
