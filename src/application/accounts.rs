use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{Account, AccountId, AccountStatus, BalanceSnapshot, Cents};
use crate::storage::{LedgerStore, UnitOfWork};

use super::{ErrorClass, LedgerError};

/// Opens accounts and serves non-exclusive balance reads.
pub struct AccountRepository<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> Clone for AccountRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> AccountRepository<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Open a new active account. The initial balance defaults to zero and may
    /// not be negative.
    pub async fn create_account(&self, initial_balance: Option<Cents>) -> Result<AccountId, LedgerError> {
        let initial_balance = initial_balance.unwrap_or(0);
        if initial_balance < 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "initial balance must not be negative, got {}",
                initial_balance
            )));
        }

        let account = self
            .store
            .create_account(initial_balance)
            .await
            .map_err(LedgerError::LedgerWriteFailed)?;

        info!(account_id = %account.id, initial_balance, "account opened");
        Ok(account.id)
    }

    /// Current balance and status. May observe any recently committed state.
    pub async fn get_balance(&self, id: AccountId) -> Result<BalanceSnapshot, LedgerError> {
        let account = self.get_account(id).await?;
        Ok(BalanceSnapshot::from(&account))
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .get_account(id)
            .await
            .map_err(LedgerError::Store)?
            .ok_or(LedgerError::AccountNotFound(id))
    }

    /// Close an account. Closure is terminal; the row is kept.
    pub async fn close_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let mut unit = self
            .store
            .begin()
            .await
            .map_err(LedgerError::LedgerWriteFailed)?;

        let account = match unit.acquire_for_update(id).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(abort(unit, LedgerError::AccountNotFound(id)).await),
            Err(e) => return Err(abort(unit, LedgerError::LedgerWriteFailed(e)).await),
        };
        if !account.is_active() {
            return Err(abort(unit, LedgerError::AccountClosed(id)).await);
        }

        let closed = match unit.set_status(id, AccountStatus::Closed).await {
            Ok(closed) => closed,
            Err(e) => return Err(abort(unit, LedgerError::LedgerWriteFailed(e)).await),
        };
        unit.commit().await.map_err(LedgerError::LedgerWriteFailed)?;

        info!(account_id = %id, balance = closed.balance, "account closed");
        Ok(closed)
    }
}

/// Roll back a unit on a failure path and hand the failure back.
/// A failed rollback is logged; the unit is dropped either way, which also
/// discards its writes.
pub(crate) async fn abort<U: UnitOfWork>(unit: U, error: LedgerError) -> LedgerError {
    if let Err(rollback_error) = unit.rollback().await {
        warn!(%error, "rollback failed: {rollback_error:#}");
    }
    match error.class() {
        ErrorClass::ServerError => warn!(%error, "unit of work aborted"),
        _ => debug!(%error, "unit of work aborted"),
    }
    error
}
