//! Vault manifest (`/dpack.json`) reading with an offset-keyed cache.

use super::handle::CachedManifest;
use super::Vaultr;
use pinfold_archive::{Archive, ArchiveError};
use pinfold_core::VaultKey;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Location of the manifest in a vault's file tree.
pub const MANIFEST_PATH: &str = "/dpack.json";

/// Manifests larger than this are not parsed.
pub const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Error)]
enum ManifestError {
    #[error("manifest is {0} bytes, over the {MAX_MANIFEST_SIZE} byte limit")]
    TooLarge(u64),

    #[error("manifest is not a JSON object")]
    NotAnObject,

    #[error("invalid manifest JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

impl Vaultr {
    /// The manifest of a loaded vault's newest version.
    ///
    /// The file is parsed again only when its content offset moved. When it
    /// cannot be read or parsed, the last good copy is returned, if any.
    pub async fn get_manifest(&self, key: &VaultKey) -> Option<Value> {
        let handle = self.registry.get(key)?;
        let cached = handle.cached_manifest();
        let cached_offset = cached.as_ref().map(|manifest| manifest.offset);

        match read_manifest(handle.archive().as_ref(), cached_offset).await {
            Ok(Some(fresh)) => {
                let document = fresh.document.clone();
                handle.cache_manifest(fresh);
                Some(document)
            }
            Ok(None) => cached.map(|manifest| manifest.document),
            Err(ManifestError::Archive(e)) if e.is_not_found() => {
                cached.map(|manifest| manifest.document)
            }
            Err(e) => {
                debug!(vault = %key, error = %e, "Manifest unreadable, using cached copy");
                cached.map(|manifest| manifest.document)
            }
        }
    }
}

/// Read and parse the manifest, or `None` if it sits at `cached_offset`.
async fn read_manifest(
    archive: &dyn Archive,
    cached_offset: Option<u64>,
) -> Result<Option<CachedManifest>, ManifestError> {
    let entry = archive.stat(MANIFEST_PATH).await?;
    if cached_offset == Some(entry.offset) {
        return Ok(None);
    }
    if entry.size > MAX_MANIFEST_SIZE {
        return Err(ManifestError::TooLarge(entry.size));
    }

    let bytes = archive.read_file(MANIFEST_PATH).await?;
    let document: Value = serde_json::from_slice(&bytes)?;
    if !document.is_object() {
        return Err(ManifestError::NotAnObject);
    }
    Ok(Some(CachedManifest {
        offset: entry.offset,
        document,
    }))
}
