//! Core domain types and shared primitives for pinfold.
//!
//! This crate defines the pieces every other crate agrees on:
//! - Vault keys and their derived discovery keys
//! - Flock intents and per-version download statistics
//! - The process-wide named async lock
//! - Application configuration

pub mod config;
pub mod error;
pub mod key;
pub mod lock;
pub mod vault;

pub use error::{Error, Result};
pub use key::{DiscoveryKey, VaultKey};
pub use lock::{LockTable, NamedLockGuard};
pub use vault::{FlockIntent, ProgressEvent, VaultStats};

/// Lock serializing user record mutations.
pub const USERS_LOCK: &str = "users";

/// Lock serializing vault record mutations.
pub const VAULTS_LOCK: &str = "vaults";

/// Lock shared by every background job so no two run at once.
pub const JOB_LOCK: &str = "vaultr-job";

/// Lock shared by every stats recomputation across all vaults.
pub const COMPUTE_STATS_LOCK: &str = "vaultr-compute-stats";

/// Maximum number of entries kept in the popularity index.
pub const POPULAR_INDEX_SIZE: usize = 100;
