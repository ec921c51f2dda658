//! HTTP request handlers.

pub mod admin;
pub mod common;
pub mod vaults;

pub use admin::*;
pub use common::*;
pub use vaults::*;
