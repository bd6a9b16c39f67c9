mod common;

use anyhow::Result;
use coffer::application::{ErrorClass, LedgerError};
use coffer::domain::{AccountId, AccountStatus, TransactionType};
use coffer::storage::LedgerStore;
use common::{Harness, memory_harness, sqlite_harness};

/// Run one scenario against both the SQLite store and the in-memory store.
macro_rules! on_both_stores {
    ($($scenario:ident),* $(,)?) => {
        $(
            mod $scenario {
                use super::*;

                #[tokio::test]
                async fn sqlite() -> Result<()> {
                    let (harness, _temp) = sqlite_harness().await?;
                    super::$scenario(&harness).await
                }

                #[tokio::test]
                async fn memory() -> Result<()> {
                    super::$scenario(&memory_harness()).await
                }
            }
        )*
    };
}

on_both_stores!(
    deposit_then_withdraw,
    withdrawal_beyond_balance_is_rejected,
    zero_and_negative_amounts_are_rejected,
    unknown_account,
    negative_initial_balance_is_rejected,
    closed_account_accepts_no_movements,
    closing_twice_is_rejected,
    withdraw_to_exactly_zero,
    history_pagination,
    history_limit_bounds,
    many_movements_replay,
    accounts_are_isolated,
);

async fn deposit_then_withdraw<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(0).await?;

    let deposit = h.ledger.deposit(id, 10000).await?;
    assert_eq!(deposit.new_balance, 10000);

    let withdrawal = h.ledger.withdraw(id, 3000).await?;
    assert_eq!(withdrawal.new_balance, 7000);
    assert!(withdrawal.transaction_id > deposit.transaction_id);

    let snapshot = h.accounts.get_balance(id).await?;
    assert_eq!(snapshot.balance, 7000);
    assert_eq!(snapshot.status, AccountStatus::Active);

    // Newest first.
    assert_eq!(
        h.history(id).await?,
        vec![
            (TransactionType::Withdrawal, 3000, 7000),
            (TransactionType::Deposit, 10000, 10000),
        ]
    );

    let entries = h.ledger.list_transactions(id, 10, 0).await?;
    assert_eq!(entries[0].id, withdrawal.transaction_id);
    assert_eq!(entries[1].id, deposit.transaction_id);
    assert!(entries[0].timestamp >= entries[1].timestamp);
    assert!(entries.iter().all(|t| t.account_id == id));

    h.assert_replays(id).await
}

async fn withdrawal_beyond_balance_is_rejected<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(5000).await?;

    let err = h.ledger.withdraw(id, 10000).await.unwrap_err();
    assert!(
        matches!(
            err,
            LedgerError::InsufficientFunds {
                account_id,
                balance: 5000,
                required: 10000,
            } if account_id == id
        ),
        "unexpected error: {err}"
    );
    assert_eq!(err.class(), ErrorClass::BadRequest);

    assert_eq!(h.balance(id).await?, 5000);
    assert!(h.history(id).await?.is_empty());
    h.assert_replays(id).await
}

async fn zero_and_negative_amounts_are_rejected<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(1000).await?;
    let before = h.accounts.get_account(id).await?;

    for amount in [0, -1, -5000] {
        let err = h.ledger.deposit(id, amount).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)), "{err}");

        let err = h.ledger.withdraw(id, amount).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidArgument(_)), "{err}");
    }

    // Rejected before the store was touched: not even the lock version moved.
    let after = h.accounts.get_account(id).await?;
    assert_eq!(after, before);
    assert!(h.history(id).await?.is_empty());

    // Amount validation wins over account lookup.
    let err = h.ledger.deposit(AccountId(424242), 0).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidArgument(_)));
    Ok(())
}

async fn unknown_account<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let missing = AccountId(9999);

    let err = h.ledger.deposit(missing, 100).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(id) if id == missing));
    assert_eq!(err.class(), ErrorClass::NotFound);

    let err = h.ledger.withdraw(missing, 100).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(_)));

    let err = h.accounts.get_balance(missing).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(_)));

    let err = h.ledger.list_transactions(missing, 10, 0).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(_)));

    let err = h.ledger.verify_account(missing).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(_)));

    let err = h.accounts.close_account(missing).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(_)));
    Ok(())
}

async fn negative_initial_balance_is_rejected<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let err = h.accounts.create_account(Some(-1)).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidArgument(_)));

    let id = h.accounts.create_account(None).await?;
    assert_eq!(h.balance(id).await?, 0);

    let account = h.accounts.get_account(id).await?;
    assert_eq!(account.initial_balance, 0);
    assert_eq!(account.status, AccountStatus::Active);
    Ok(())
}

async fn closed_account_accepts_no_movements<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(2500).await?;
    h.ledger.deposit(id, 500).await?;

    let closed = h.accounts.close_account(id).await?;
    assert_eq!(closed.status, AccountStatus::Closed);
    assert_eq!(closed.balance, 3000);

    let err = h.ledger.deposit(id, 100).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountClosed(closed_id) if closed_id == id));
    assert_eq!(err.class(), ErrorClass::Forbidden);

    let err = h.ledger.withdraw(id, 100).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountClosed(_)));

    // Still readable, unchanged, with only the pre-closure entry.
    let snapshot = h.accounts.get_balance(id).await?;
    assert_eq!(snapshot.status, AccountStatus::Closed);
    assert_eq!(snapshot.balance, 3000);
    assert_eq!(h.history(id).await?.len(), 1);
    h.assert_replays(id).await
}

async fn closing_twice_is_rejected<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(0).await?;
    h.accounts.close_account(id).await?;

    let err = h.accounts.close_account(id).await.unwrap_err();
    assert!(matches!(err, LedgerError::AccountClosed(_)));
    Ok(())
}

async fn withdraw_to_exactly_zero<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(4200).await?;

    let receipt = h.ledger.withdraw(id, 4200).await?;
    assert_eq!(receipt.new_balance, 0);

    let err = h.ledger.withdraw(id, 1).await.unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { balance: 0, .. }));

    assert_eq!(h.balance(id).await?, 0);
    h.assert_replays(id).await
}

async fn history_pagination<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(0).await?;
    for amount in 1..=5 {
        h.ledger.deposit(id, amount * 100).await?;
    }

    let first = h.ledger.list_transactions(id, 2, 0).await?;
    let second = h.ledger.list_transactions(id, 2, 2).await?;
    let third = h.ledger.list_transactions(id, 2, 4).await?;
    let past_end = h.ledger.list_transactions(id, 2, 10).await?;

    let amounts: Vec<_> = first
        .iter()
        .chain(&second)
        .chain(&third)
        .map(|t| t.amount)
        .collect();
    assert_eq!(amounts, vec![500, 400, 300, 200, 100]);
    assert!(past_end.is_empty());
    Ok(())
}

async fn history_limit_bounds<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(0).await?;

    let err = h.ledger.list_transactions(id, 0, 0).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidArgument(_)));

    let err = h.ledger.list_transactions(id, 501, 0).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidArgument(_)));

    assert!(h.ledger.list_transactions(id, 500, 0).await?.is_empty());
    Ok(())
}

async fn many_movements_replay<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let id = h.open(1000).await?;
    let mut expected = 1000;

    for step in 0..40_i64 {
        let amount = (step * 37) % 900 + 1;
        if step % 3 == 0 {
            match h.ledger.withdraw(id, amount).await {
                Ok(receipt) => {
                    expected -= amount;
                    assert_eq!(receipt.new_balance, expected);
                }
                Err(LedgerError::InsufficientFunds { balance, .. }) => {
                    assert_eq!(balance, expected);
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            expected += amount;
            assert_eq!(h.ledger.deposit(id, amount).await?.new_balance, expected);
        }
        assert!(h.balance(id).await? >= 0);
    }

    assert_eq!(h.balance(id).await?, expected);

    let report = h.ledger.verify_account(id).await?;
    assert!(report.is_consistent());
    assert_eq!(report.initial_balance, 1000);
    assert_eq!(report.replayed_balance, expected);
    Ok(())
}

async fn accounts_are_isolated<S: LedgerStore>(h: &Harness<S>) -> Result<()> {
    let a = h.open(0).await?;
    let b = h.open(100).await?;
    assert_ne!(a, b);

    h.ledger.deposit(a, 700).await?;
    h.ledger.withdraw(b, 40).await?;

    assert_eq!(h.balance(a).await?, 700);
    assert_eq!(h.balance(b).await?, 60);
    assert_eq!(h.history(a).await?.len(), 1);
    assert_eq!(h.history(b).await?.len(), 1);
    h.assert_replays(a).await?;
    h.assert_replays(b).await
}
