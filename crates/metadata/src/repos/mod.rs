//! Repository traits for metadata operations.

pub mod users;
pub mod vaults;

pub use users::UserRepo;
pub use vaults::VaultRepo;
