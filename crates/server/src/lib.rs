//! Vault hosting node for pinfold.
//!
//! This crate provides:
//! - The vault engine: runtime registry, disk accounting, flocking policy,
//!   replication multiplexer, stats computation and background jobs
//! - A thin HTTP surface over it (public status, admin operations)
//! - Prometheus metrics

pub mod auth;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod state;

pub use auth::TraceId;
pub use engine::Vaultr;
pub use error::ApiError;
pub use routes::create_router;
pub use state::AppState;
