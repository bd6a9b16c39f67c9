mod locks;
mod memory;
mod sqlite;
mod store;

pub use memory::*;
pub use sqlite::*;
pub use store::*;

/// SQL migration for the accounts and transactions schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");
