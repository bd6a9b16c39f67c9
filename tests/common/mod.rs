// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use coffer::application::{AccountRepository, TransactionLedger};
use coffer::config::LedgerConfig;
use coffer::domain::{AccountId, Cents, TransactionType};
use coffer::storage::{LedgerStore, MemoryStore, SqliteStore};
use tempfile::TempDir;

/// Repository and ledger wired over one shared store.
pub struct Harness<S: LedgerStore> {
    pub store: Arc<S>,
    pub accounts: AccountRepository<S>,
    pub ledger: TransactionLedger<S>,
}

impl<S: LedgerStore> Harness<S> {
    pub fn new(store: S, deadline: Duration) -> Self {
        let store = Arc::new(store);
        Self {
            accounts: AccountRepository::new(Arc::clone(&store)),
            ledger: TransactionLedger::new(Arc::clone(&store)).with_deadline(deadline),
            store,
        }
    }

    /// Open an account with the given balance.
    pub async fn open(&self, initial_balance: Cents) -> Result<AccountId> {
        Ok(self.accounts.create_account(Some(initial_balance)).await?)
    }

    pub async fn balance(&self, id: AccountId) -> Result<Cents> {
        Ok(self.accounts.get_balance(id).await?.balance)
    }

    /// Every entry for the account, newest first.
    pub async fn history(&self, id: AccountId) -> Result<Vec<(TransactionType, Cents, Cents)>> {
        let entries = self.ledger.list_transactions(id, 500, 0).await?;
        Ok(entries
            .into_iter()
            .map(|t| (t.kind, t.amount, t.resulting_balance))
            .collect())
    }

    /// Assert the account's ledger replays to its recorded balance.
    pub async fn assert_replays(&self, id: AccountId) -> Result<()> {
        let report = self.ledger.verify_account(id).await?;
        assert!(report.is_consistent(), "ledger replay mismatch: {report:?}");
        Ok(())
    }
}

/// Helper to create a harness over a temporary SQLite database
pub async fn sqlite_harness() -> Result<(Harness<SqliteStore>, TempDir)> {
    sqlite_harness_with(LedgerConfig::default().unit_deadline).await
}

pub async fn sqlite_harness_with(deadline: Duration) -> Result<(Harness<SqliteStore>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let config = LedgerConfig::for_path(db_path.to_str().unwrap()).with_unit_deadline(deadline);
    let store = SqliteStore::init(&config).await?;
    Ok((Harness::new(store, deadline), temp_dir))
}

pub fn memory_harness() -> Harness<MemoryStore> {
    memory_harness_with(LedgerConfig::default().unit_deadline)
}

pub fn memory_harness_with(deadline: Duration) -> Harness<MemoryStore> {
    Harness::new(MemoryStore::new(), deadline)
}
