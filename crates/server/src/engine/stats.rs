//! Block-level download statistics.

use super::error::EngineResult;
use super::handle::VaultHandle;
use super::Vaultr;
use crate::metrics::STATS_RECOMPUTES;
use pinfold_archive::{Archive, Checkout};
use pinfold_core::{COMPUTE_STATS_LOCK, ProgressEvent, VaultStats};
use pinfold_metadata::VaultUpdate;
use tracing::{debug, trace};

impl Vaultr {
    /// Recount blocks, bytes and files of the vault's newest version and
    /// publish the resulting progress.
    ///
    /// Returns `None` when the archive is not ready. Runs under the global
    /// stats lock, so at most one scan is in progress at a time.
    pub async fn recompute_stats(&self, handle: &VaultHandle) -> EngineResult<Option<VaultStats>> {
        let _guard = self.locks.acquire(COMPUTE_STATS_LOCK).await;

        let archive = handle.archive();
        if !archive.is_ready() {
            debug!(vault = %handle.key(), "Archive not ready, skipping stats");
            return Ok(None);
        }

        let checkout = archive.checkout(archive.version())?;
        let stats = walk(archive.as_ref(), checkout.as_ref()).await?;
        handle.set_stats(stats);

        match self
            .metadata
            .update_vault(handle.key(), &VaultUpdate::stats(stats))
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                trace!(vault = %handle.key(), "No vault record for stats");
            }
            Err(e) => return Err(e.into()),
        }
        STATS_RECOMPUTES.inc();

        let event = ProgressEvent {
            progress: stats.progress(),
            disk_usage: handle.disk_usage(),
        };
        self.progress.publish(handle.key(), event);

        debug!(
            vault = %handle.key(),
            version = checkout.version(),
            blocks = stats.num_blocks,
            downloaded = stats.num_downloaded_blocks,
            files = stats.num_files,
            "Stats recomputed"
        );
        Ok(Some(stats))
    }
}

/// Count every file in `checkout`, checking block presence against `archive`.
async fn walk(archive: &dyn Archive, checkout: &dyn Checkout) -> EngineResult<VaultStats> {
    let mut stats = VaultStats::default();
    let mut dirs = vec!["/".to_string()];

    while let Some(dir) = dirs.pop() {
        for name in checkout.readdir(&dir).await? {
            let path = if dir == "/" {
                format!("/{name}")
            } else {
                format!("{dir}/{name}")
            };
            let entry = checkout.stat(&path).await?;
            if entry.is_dir() {
                dirs.push(path);
                continue;
            }

            stats.num_files += 1;
            stats.num_bytes += entry.size;
            stats.num_blocks += entry.blocks;
            stats.num_downloaded_blocks += (entry.offset..entry.offset + entry.blocks)
                .filter(|index| archive.has_block(*index))
                .count() as u64;
        }
    }
    Ok(stats)
}
