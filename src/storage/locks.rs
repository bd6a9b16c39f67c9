use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use tokio::sync::OwnedMutexGuard;

use crate::domain::AccountId;

type AccountMutex = Arc<tokio::sync::Mutex<()>>;

/// In-process exclusivity, one async mutex per account.
///
/// A guard is held for the lifetime of a unit of work. Entries are created on
/// first use and dropped again by [`AccountLocks::release_unused`] once nobody
/// holds or waits on them.
#[derive(Debug, Clone, Default)]
pub(crate) struct AccountLocks {
    table: Arc<Mutex<HashMap<AccountId, AccountMutex>>>,
}

impl AccountLocks {
    /// Wait for exclusive access to `id`.
    pub(crate) async fn lock(&self, id: AccountId) -> Result<OwnedMutexGuard<()>> {
        let mutex = {
            let mut table = self.table()?;
            Arc::clone(table.entry(id).or_default())
        };
        Ok(mutex.lock_owned().await)
    }

    /// Forget the entry for `id` if no guard or waiter still refers to it.
    /// Call after dropping the guard for an account that turned out not to
    /// exist.
    pub(crate) fn release_unused(&self, id: AccountId) -> Result<()> {
        let mut table = self.table()?;
        // Clones are only taken under the table lock, so a count of one
        // means the table holds the last reference.
        if table.get(&id).is_some_and(|m| Arc::strong_count(m) == 1) {
            table.remove(&id);
        }
        Ok(())
    }

    /// Number of accounts with a live lock entry.
    pub(crate) fn tracked(&self) -> Result<usize> {
        Ok(self.table()?.len())
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<AccountId, AccountMutex>>> {
        self.table
            .lock()
            .map_err(|_| anyhow!("account lock table poisoned"))
    }
}
