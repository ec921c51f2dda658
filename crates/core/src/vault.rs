//! Vault runtime value types.

use serde::{Deserialize, Serialize};

/// Requested swarm participation for a vault.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlockIntent {
    pub upload: bool,
    pub download: bool,
}

impl FlockIntent {
    /// Serve and fetch.
    pub const FULL: Self = Self {
        upload: true,
        download: true,
    };

    /// Neither serve nor fetch: the vault leaves the swarm.
    pub const DORMANT: Self = Self {
        upload: false,
        download: false,
    };

    /// Intent for a vault whose owner sits at `quota_pct` of their quota.
    /// Over-quota owners keep seeding existing data but stop growing it.
    pub fn for_quota(quota_pct: f64) -> Self {
        Self {
            upload: true,
            download: quota_pct < 1.0,
        }
    }

    pub fn is_dormant(&self) -> bool {
        !self.upload && !self.download
    }
}

/// Point-in-time block statistics for a vault's newest version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultStats {
    pub num_blocks: u64,
    pub num_downloaded_blocks: u64,
    pub num_bytes: u64,
    pub num_files: u64,
}

impl VaultStats {
    /// Fraction of blocks present locally, in `[0, 1]`. An empty vault reports 0.
    pub fn progress(&self) -> f64 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        (self.num_downloaded_blocks as f64 / self.num_blocks as f64).min(1.0)
    }

    pub fn is_fully_downloaded(&self) -> bool {
        self.num_blocks > 0 && self.num_downloaded_blocks >= self.num_blocks
    }

    /// True when no counters have been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.num_blocks == 0 && self.num_files == 0 && self.num_bytes == 0
    }
}

/// Progress notification published after each stats recomputation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub progress: f64,
    pub disk_usage: Option<u64>,
}
