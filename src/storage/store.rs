use anyhow::Result;
use async_trait::async_trait;

use crate::domain::{Account, AccountId, AccountStatus, Cents, NewTransaction, Transaction};

/// The durable system of record for accounts and ledger entries.
///
/// Reads on the store itself are non-exclusive. Anything that mutates an
/// existing account goes through a [`UnitOfWork`] obtained from [`begin`].
///
/// [`begin`]: LedgerStore::begin
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Unit: UnitOfWork;

    /// Persist a new active account and return it with its assigned id and
    /// creation time.
    async fn create_account(&self, initial_balance: Cents) -> Result<Account>;

    /// Read an account without taking exclusivity.
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;

    /// Entries for an account, newest first.
    async fn list_transactions(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Transaction>>;

    /// Open a unit of work. Nothing written through it is visible to other
    /// readers until [`UnitOfWork::commit`].
    async fn begin(&self) -> Result<Self::Unit>;
}

/// A bounded sequence of store operations that commits or aborts as a whole.
///
/// Dropping a unit without committing rolls it back and releases any account
/// it acquired. Every write in a unit carries one timestamp, chosen by the
/// store and never earlier than the held account's last write.
#[async_trait]
pub trait UnitOfWork: Send + Sized + 'static {
    /// Read an account while taking exclusive write access to it for the rest
    /// of the unit. A concurrent unit acquiring the same account waits until
    /// this one commits or aborts; units on other accounts do not wait.
    async fn acquire_for_update(&mut self, id: AccountId) -> Result<Option<Account>>;

    /// Every entry for the held account in ledger order, oldest first,
    /// as seen from inside this unit.
    async fn replay_entries(&mut self, account_id: AccountId) -> Result<Vec<Transaction>>;

    /// Record an entry against the held account. The store assigns its id
    /// and timestamp.
    async fn append_transaction(&mut self, entry: NewTransaction) -> Result<Transaction>;

    async fn update_balance(&mut self, id: AccountId, balance: Cents) -> Result<()>;

    /// Change the held account's status and return the account as it will
    /// read once committed.
    async fn set_status(&mut self, id: AccountId, status: AccountStatus) -> Result<Account>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}
