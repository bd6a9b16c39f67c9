//! In-memory ledger store for tests and development.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;

use crate::domain::{
    Account, AccountId, AccountStatus, Cents, NewTransaction, Transaction, TransactionId,
    ledger_now,
};

use super::locks::AccountLocks;
use super::{LedgerStore, UnitOfWork};

#[derive(Debug, Default)]
struct MemoryState {
    accounts: BTreeMap<AccountId, Account>,
    transactions: Vec<Transaction>,
    next_account_id: i64,
    next_transaction_id: i64,
}

/// Faults a test can switch on to exercise abort paths.
#[derive(Debug, Clone, Default)]
struct Faults {
    fail_appends: bool,
    fail_balance_updates: bool,
    stall: Option<Duration>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<MemoryState>,
    locks: AccountLocks,
    faults: Mutex<Faults>,
}

/// Ledger store kept entirely in process memory.
///
/// Units of work stage their writes and publish them in one step on commit,
/// so an aborted unit leaves no trace. Exclusivity is per account: units on
/// different accounts never wait on each other.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `append_transaction` fail with a store error.
    pub fn fail_appends(&self, enabled: bool) -> Result<()> {
        lock(&self.shared.faults)?.fail_appends = enabled;
        Ok(())
    }

    /// Make every `update_balance` fail with a store error.
    pub fn fail_balance_updates(&self, enabled: bool) -> Result<()> {
        lock(&self.shared.faults)?.fail_balance_updates = enabled;
        Ok(())
    }

    /// Delay every `append_transaction` by `stall`, simulating a slow store.
    pub fn stall_appends(&self, stall: Option<Duration>) -> Result<()> {
        lock(&self.shared.faults)?.stall = stall;
        Ok(())
    }

    /// Number of committed ledger entries across all accounts.
    pub fn transaction_count(&self) -> Result<usize> {
        Ok(lock(&self.shared.state)?.transactions.len())
    }

    fn faults(&self) -> Result<Faults> {
        Ok(lock(&self.shared.faults)?.clone())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| anyhow!("memory store lock poisoned"))
}

fn sorted_entries(state: &MemoryState, account_id: AccountId) -> Vec<Transaction> {
    let mut entries: Vec<Transaction> = state
        .transactions
        .iter()
        .filter(|t| t.account_id == account_id)
        .cloned()
        .collect();
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    entries
}

#[async_trait]
impl LedgerStore for MemoryStore {
    type Unit = MemoryUnit;

    async fn create_account(&self, initial_balance: Cents) -> Result<Account> {
        if initial_balance < 0 {
            bail!("initial balance must not be negative");
        }
        let at = ledger_now();
        let mut state = lock(&self.shared.state)?;
        state.next_account_id += 1;
        let account = Account {
            id: AccountId(state.next_account_id),
            balance: initial_balance,
            initial_balance,
            status: AccountStatus::Active,
            version: 0,
            created_at: at,
            updated_at: at,
        };
        state.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(lock(&self.shared.state)?.accounts.get(&id).cloned())
    }

    async fn list_transactions(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Transaction>> {
        let state = lock(&self.shared.state)?;
        Ok(sorted_entries(&state, account_id)
            .into_iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn begin(&self) -> Result<MemoryUnit> {
        Ok(MemoryUnit {
            store: self.clone(),
            guard: None,
            staged_account: None,
            staged_entries: Vec::new(),
            stamp: None,
        })
    }
}

/// Unit of work over a [`MemoryStore`].
pub struct MemoryUnit {
    store: MemoryStore,
    guard: Option<OwnedMutexGuard<()>>,
    staged_account: Option<Account>,
    staged_entries: Vec<Transaction>,
    /// Timestamp shared by every write in this unit, fixed on first use.
    stamp: Option<DateTime<Utc>>,
}

impl MemoryUnit {
    fn held_account(&mut self, id: AccountId) -> Result<&mut Account> {
        match self.staged_account.as_mut() {
            Some(account) if account.id == id => Ok(account),
            _ => bail!("Account {} is not held by this unit of work", id),
        }
    }

    fn stamp(&mut self, id: AccountId) -> Result<DateTime<Utc>> {
        if let Some(at) = self.stamp {
            return Ok(at);
        }
        let at = self.held_account(id)?.next_timestamp(ledger_now());
        self.stamp = Some(at);
        Ok(at)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn acquire_for_update(&mut self, id: AccountId) -> Result<Option<Account>> {
        if let Some(held) = &self.staged_account {
            bail!("Unit of work already holds account {}", held.id);
        }

        let locks = &self.store.shared.locks;
        let guard = locks.lock(id).await?;

        // Read the authoritative row only once the lock is held.
        let Some(mut account) = self.store.get_account(id).await? else {
            drop(guard);
            locks.release_unused(id)?;
            return Ok(None);
        };
        account.version += 1;

        self.guard = Some(guard);
        self.staged_account = Some(account.clone());
        Ok(Some(account))
    }

    async fn replay_entries(&mut self, account_id: AccountId) -> Result<Vec<Transaction>> {
        self.held_account(account_id)?;
        let mut entries = {
            let state = lock(&self.store.shared.state)?;
            sorted_entries(&state, account_id)
        };
        entries.extend(self.staged_entries.iter().cloned());
        Ok(entries)
    }

    async fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction> {
        let faults = self.store.faults()?;
        if let Some(stall) = faults.stall {
            tokio::time::sleep(stall).await;
        }
        if faults.fail_appends {
            bail!("injected fault: transaction insert failed");
        }

        if !self.held_account(entry.account_id)?.is_active() {
            bail!("account is not active");
        }
        if entry.amount <= 0 || entry.resulting_balance < 0 {
            bail!("constraint violation: invalid ledger entry");
        }

        let at = self.stamp(entry.account_id)?;
        let id = {
            let mut state = lock(&self.store.shared.state)?;
            state.next_transaction_id += 1;
            TransactionId(state.next_transaction_id)
        };
        let transaction = entry.into_transaction(id, at);
        self.staged_entries.push(transaction.clone());
        Ok(transaction)
    }

    async fn update_balance(&mut self, id: AccountId, balance: Cents) -> Result<()> {
        if self.store.faults()?.fail_balance_updates {
            bail!("injected fault: balance update failed");
        }
        if balance < 0 {
            bail!("constraint violation: negative balance");
        }
        let at = self.stamp(id)?;
        let account = self.held_account(id)?;
        account.balance = balance;
        account.updated_at = at;
        Ok(())
    }

    async fn set_status(&mut self, id: AccountId, status: AccountStatus) -> Result<Account> {
        let at = self.stamp(id)?;
        let account = self.held_account(id)?;
        account.status = status;
        account.updated_at = at;
        Ok(account.clone())
    }

    async fn commit(mut self) -> Result<()> {
        let mut state = lock(&self.store.shared.state)?;
        if let Some(account) = self.staged_account.take() {
            state.accounts.insert(account.id, account);
        }
        state.transactions.append(&mut self.staged_entries);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
