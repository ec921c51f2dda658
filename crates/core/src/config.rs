//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Admin token configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdminConfig {
    /// SHA256 hex of the admin bearer token.
    /// Generate with: `echo -n "your-secret-token" | sha256sum`
    pub token_hash: String,
}

impl AdminConfig {
    /// **For testing only.** Hash of `test-admin-token`.
    pub fn for_testing() -> Self {
        Self {
            token_hash: "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
                .to_string(),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let hash = self.token_hash.trim();
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err("admin.token_hash must be 64 hex characters (sha256)".to_string());
        }
        Ok(())
    }
}

/// Local data layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory. Vaults live under `<data_dir>/vaults`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        path: PathBuf,
        /// Query timeout in seconds (advisory only).
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(60)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

/// Archive implementation to open vaults with.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ArchiveBackendConfig {
    /// In-process archive and swarm. Peers connect through the in-memory
    /// swarm only; useful for development and tests.
    #[default]
    Memory,
}

/// Per-archive cache sizes handed to the archive implementation on open.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(default = "default_metadata_cache")]
    pub metadata_blocks: usize,
    #[serde(default = "default_content_cache")]
    pub content_blocks: usize,
    #[serde(default = "default_tree_cache")]
    pub tree_nodes: usize,
}

fn default_metadata_cache() -> usize {
    65_536
}

fn default_content_cache() -> usize {
    65_536 * 16
}

fn default_tree_cache() -> usize {
    65_536
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_blocks: default_metadata_cache(),
            content_blocks: default_content_cache(),
            tree_nodes: default_tree_cache(),
        }
    }
}

/// Archive engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub backend: ArchiveBackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Window for the leading+trailing throttle on stats recomputation.
    #[serde(default = "default_stats_throttle_ms")]
    pub stats_throttle_ms: u64,
}

fn default_stats_throttle_ms() -> u64 {
    5_000
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: ArchiveBackendConfig::default(),
            cache: CacheConfig::default(),
            stats_throttle_ms: default_stats_throttle_ms(),
        }
    }
}

impl ArchiveConfig {
    pub fn stats_throttle(&self) -> Duration {
        Duration::from_millis(self.stats_throttle_ms)
    }
}

/// Disk quota configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Quota for users without an explicit override, e.g. "100mb".
    #[serde(default = "default_disk_quota")]
    pub default_disk_quota: String,
}

fn default_disk_quota() -> String {
    "100mb".to_string()
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_disk_quota: default_disk_quota(),
        }
    }
}

impl QuotaConfig {
    /// Default quota in bytes.
    pub fn default_quota_bytes(&self) -> crate::Result<u64> {
        parse_byte_size(&self.default_disk_quota)
    }

    /// Effective quota for a user: the override when set and non-zero,
    /// the default otherwise.
    pub fn quota_for(&self, user_override: Option<u64>) -> crate::Result<u64> {
        match user_override {
            Some(quota) if quota > 0 => Ok(quota),
            _ => self.default_quota_bytes(),
        }
    }
}

/// Parse a human byte size ("512", "10kb", "1.5 GB"). Units are binary
/// multiples, matching how disk usage is reported.
pub fn parse_byte_size(input: &str) -> crate::Result<u64> {
    let s = input.trim().to_ascii_lowercase();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| crate::Error::InvalidByteSize(input.to_string()))?;

    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1 << 10,
        "mb" | "m" => 1 << 20,
        "gb" | "g" => 1 << 30,
        "tb" | "t" => 1 << 40,
        _ => return Err(crate::Error::InvalidByteSize(input.to_string())),
    };

    if !value.is_finite() || value < 0.0 {
        return Err(crate::Error::InvalidByteSize(input.to_string()));
    }
    Ok((value * multiplier as f64) as u64)
}

/// Background job scheduling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Run the periodic jobs at all.
    #[serde(default = "default_jobs_enabled")]
    pub enabled: bool,
    #[serde(default = "default_popular_index_interval_secs")]
    pub popular_index_interval_secs: u64,
    #[serde(default = "default_user_disk_usage_interval_secs")]
    pub user_disk_usage_interval_secs: u64,
    #[serde(default = "default_dead_vaults_interval_secs")]
    pub dead_vaults_interval_secs: u64,
}

fn default_jobs_enabled() -> bool {
    true
}

fn default_popular_index_interval_secs() -> u64 {
    30
}

fn default_user_disk_usage_interval_secs() -> u64 {
    300
}

fn default_dead_vaults_interval_secs() -> u64 {
    3600
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: default_jobs_enabled(),
            popular_index_interval_secs: default_popular_index_interval_secs(),
            user_disk_usage_interval_secs: default_user_disk_usage_interval_secs(),
            dead_vaults_interval_secs: default_dead_vaults_interval_secs(),
        }
    }
}

impl JobsConfig {
    pub fn popular_index_interval(&self) -> Duration {
        Duration::from_secs(self.popular_index_interval_secs)
    }

    pub fn user_disk_usage_interval(&self) -> Duration {
        Duration::from_secs(self.user_disk_usage_interval_secs)
    }

    pub fn dead_vaults_interval(&self) -> Duration {
        Duration::from_secs(self.dead_vaults_interval_secs)
    }

    /// Zero intervals would spin the scheduler.
    pub fn validate(&self) -> Result<(), String> {
        for (name, secs) in [
            ("popular_index_interval_secs", self.popular_index_interval_secs),
            (
                "user_disk_usage_interval_secs",
                self.user_disk_usage_interval_secs,
            ),
            ("dead_vaults_interval_secs", self.dead_vaults_interval_secs),
        ] {
            if secs == 0 {
                return Err(format!("jobs.{name} cannot be 0"));
            }
        }
        Ok(())
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    /// Admin token configuration (required).
    pub admin: AdminConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl AppConfig {
    /// **For testing only.** Short throttle window, scheduler disabled.
    pub fn for_testing() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            metadata: MetadataConfig::default(),
            admin: AdminConfig::for_testing(),
            archive: ArchiveConfig {
                stats_throttle_ms: 50,
                ..Default::default()
            },
            quota: QuotaConfig::default(),
            jobs: JobsConfig {
                enabled: false,
                ..Default::default()
            },
        }
    }

    /// Check cross-section invariants before the server starts.
    pub fn validate(&self) -> Result<(), String> {
        self.admin.validate()?;
        self.jobs.validate()?;
        self.quota
            .default_quota_bytes()
            .map_err(|e| format!("quota.default_disk_quota: {e}"))?;
        if self.archive.stats_throttle_ms == 0 {
            return Err("archive.stats_throttle_ms cannot be 0".to_string());
        }
        Ok(())
    }
}
