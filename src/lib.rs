pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod storage;

pub use application::{AccountRepository, LedgerError, TransactionLedger};
pub use config::LedgerConfig;
pub use domain::*;
pub use storage::{LedgerStore, MemoryStore, SqliteStore, UnitOfWork};
