//! Application state shared across handlers.

use crate::engine::Vaultr;
use pinfold_core::config::AppConfig;
use pinfold_metadata::MetadataStore;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store.
    pub metadata: Arc<dyn MetadataStore>,
    /// Vault engine.
    pub engine: Arc<Vaultr>,
}

impl AppState {
    /// Create the state from a running engine. Config and metadata are
    /// shared with it.
    pub fn new(engine: Arc<Vaultr>) -> Self {
        Self {
            config: engine.config().clone(),
            metadata: engine.metadata().clone(),
            engine,
        }
    }
}
