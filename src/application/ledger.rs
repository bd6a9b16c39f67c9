use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::config::DEFAULT_UNIT_DEADLINE;
use crate::domain::{
    Account, AccountId, Cents, MovementError, NewTransaction, ReplayReport, Transaction, TransactionId,
    TransactionType, apply_movement, build_replay_report,
};
use crate::storage::{LedgerStore, UnitOfWork};

use super::LedgerError;
use super::accounts::abort;

/// Largest page `list_transactions` will return.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Outcome of a committed movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Receipt {
    pub transaction_id: TransactionId,
    /// Balance computed and written in the unit of work that committed.
    pub new_balance: Cents,
}

/// Executes deposits and withdrawals as single all-or-nothing units of work.
///
/// Each movement runs: validate, begin, acquire the account exclusively,
/// check the rule, apply, record the entry and the new balance, commit.
/// Every failure before commit rolls the unit back. Nothing is retried here.
pub struct TransactionLedger<S: LedgerStore> {
    store: Arc<S>,
    deadline: Duration,
}

impl<S: LedgerStore> Clone for TransactionLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            deadline: self.deadline,
        }
    }
}

impl<S: LedgerStore> TransactionLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            deadline: DEFAULT_UNIT_DEADLINE,
        }
    }

    /// Bound each unit of work, from begin up to commit.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn deposit(&self, account_id: AccountId, amount: Cents) -> Result<Receipt, LedgerError> {
        self.execute(account_id, TransactionType::Deposit, amount).await
    }

    pub async fn withdraw(&self, account_id: AccountId, amount: Cents) -> Result<Receipt, LedgerError> {
        self.execute(account_id, TransactionType::Withdrawal, amount).await
    }

    #[instrument(skip(self), fields(deadline = ?self.deadline))]
    async fn execute(
        &self,
        account_id: AccountId,
        kind: TransactionType,
        amount: Cents,
    ) -> Result<Receipt, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidArgument(format!(
                "amount must be positive, got {}",
                amount
            )));
        }

        // Only the staging half runs under the deadline. If it elapses, the
        // staged unit is dropped, which rolls it back; commit is never started
        // for a timed-out unit.
        let staged = tokio::time::timeout(self.deadline, self.stage(account_id, kind, amount)).await;
        let (unit, transaction) = match staged {
            Ok(result) => result?,
            Err(_) => {
                warn!(%account_id, "unit of work exceeded its deadline; rolled back");
                return Err(LedgerError::DeadlineExceeded(self.deadline));
            }
        };

        unit.commit().await.map_err(|e| {
            warn!(%account_id, "commit failed: {e:#}");
            LedgerError::LedgerWriteFailed(e)
        })?;

        info!(
            %account_id,
            transaction_id = %transaction.id,
            new_balance = transaction.resulting_balance,
            "movement committed"
        );
        Ok(Receipt {
            transaction_id: transaction.id,
            new_balance: transaction.resulting_balance,
        })
    }

    /// Everything up to commit. On any failure the unit is rolled back before
    /// returning; on success the caller owns the commit.
    async fn stage(
        &self,
        account_id: AccountId,
        kind: TransactionType,
        amount: Cents,
    ) -> Result<(S::Unit, Transaction), LedgerError> {
        let mut unit = self
            .store
            .begin()
            .await
            .map_err(LedgerError::LedgerWriteFailed)?;

        let account = match unit.acquire_for_update(account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(abort(unit, LedgerError::AccountNotFound(account_id)).await),
            Err(e) => return Err(abort(unit, LedgerError::LedgerWriteFailed(e)).await),
        };
        debug!(%account_id, balance = account.balance, version = account.version, "account acquired");

        if !account.is_active() {
            return Err(abort(unit, LedgerError::AccountClosed(account_id)).await);
        }

        let new_balance = match apply_movement(account.balance, kind, amount) {
            Ok(balance) => balance,
            Err(MovementError::InsufficientFunds { balance, required }) => {
                let error = LedgerError::InsufficientFunds {
                    account_id,
                    balance,
                    required,
                };
                return Err(abort(unit, error).await);
            }
            Err(e @ MovementError::Overflow { .. }) => {
                return Err(abort(unit, LedgerError::InvalidArgument(e.to_string())).await);
            }
        };

        let entry = NewTransaction {
            account_id,
            amount,
            kind,
            resulting_balance: new_balance,
        };

        let transaction = match unit.append_transaction(entry).await {
            Ok(transaction) => transaction,
            Err(e) => return Err(abort(unit, LedgerError::LedgerWriteFailed(e)).await),
        };
        if let Err(e) = unit.update_balance(account_id, new_balance).await {
            return Err(abort(unit, LedgerError::LedgerWriteFailed(e)).await);
        }

        Ok((unit, transaction))
    }

    /// Entries for an account, newest first. Read-only; takes no lock.
    pub async fn list_transactions(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Transaction>, LedgerError> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(LedgerError::InvalidArgument(format!(
                "limit must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, limit
            )));
        }
        self.require_account(account_id).await?;

        self.store
            .list_transactions(account_id, limit, offset)
            .await
            .map_err(LedgerError::Store)
    }

    /// Replay the account's ledger onto its opening balance and compare the
    /// result, entry by entry, with what was recorded.
    ///
    /// Runs inside a unit of work so the balance and the entries come from the
    /// same state; the unit writes nothing and is always rolled back.
    pub async fn verify_account(&self, account_id: AccountId) -> Result<ReplayReport, LedgerError> {
        let mut unit = self.store.begin().await.map_err(LedgerError::Store)?;

        let account = match unit.acquire_for_update(account_id).await {
            Ok(Some(account)) => account,
            Ok(None) => return Err(abort(unit, LedgerError::AccountNotFound(account_id)).await),
            Err(e) => return Err(abort(unit, LedgerError::Store(e)).await),
        };
        let entries = match unit.replay_entries(account_id).await {
            Ok(entries) => entries,
            Err(e) => return Err(abort(unit, LedgerError::Store(e)).await),
        };
        if let Err(e) = unit.rollback().await {
            warn!(%account_id, "rollback after verification failed: {e:#}");
        }

        let report = build_replay_report(
            account_id,
            account.initial_balance,
            account.balance,
            &entries,
        );
        if !report.is_consistent() {
            warn!(?report, "ledger replay does not match recorded balance");
        }
        Ok(report)
    }

    async fn require_account(&self, account_id: AccountId) -> Result<Account, LedgerError> {
        self.store
            .get_account(account_id)
            .await
            .map_err(LedgerError::Store)?
            .ok_or(LedgerError::AccountNotFound(account_id))
    }
}
