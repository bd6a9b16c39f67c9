use serde::Serialize;

use super::{AccountId, Cents, Transaction, TransactionId, TransactionType};

/// Apply one movement to a balance.
/// Deposits add, withdrawals subtract and may never take the balance below zero.
/// Nothing is applied partially: either the full amount moves or an error is returned.
pub fn apply_movement(
    balance: Cents,
    kind: TransactionType,
    amount: Cents,
) -> Result<Cents, MovementError> {
    match kind {
        TransactionType::Deposit => balance
            .checked_add(amount)
            .ok_or(MovementError::Overflow { balance, amount }),
        TransactionType::Withdrawal => {
            if balance < amount {
                return Err(MovementError::InsufficientFunds {
                    balance,
                    required: amount,
                });
            }
            Ok(balance - amount)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MovementError {
    InsufficientFunds { balance: Cents, required: Cents },
    Overflow { balance: Cents, amount: Cents },
}

impl std::fmt::Display for MovementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MovementError::InsufficientFunds { balance, required } => write!(
                f,
                "withdrawal of {} cents exceeds balance of {} cents",
                required, balance
            ),
            MovementError::Overflow { balance, amount } => write!(
                f,
                "deposit of {} cents overflows balance of {} cents",
                amount, balance
            ),
        }
    }
}

impl std::error::Error for MovementError {}

/// Outcome of replaying an account's ledger against its stored balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub account_id: AccountId,
    pub initial_balance: Cents,
    pub recorded_balance: Cents,
    pub replayed_balance: Cents,
    pub entry_count: usize,
    /// First entry whose `resulting_balance` disagrees with the running total,
    /// or that overflows it.
    pub first_broken_entry: Option<TransactionId>,
}

impl ReplayReport {
    pub fn is_consistent(&self) -> bool {
        self.recorded_balance == self.replayed_balance && self.first_broken_entry.is_none()
    }
}

/// Build a replay report. `entries` must be in ledger order (oldest first).
pub fn build_replay_report(
    account_id: AccountId,
    initial_balance: Cents,
    recorded_balance: Cents,
    entries: &[Transaction],
) -> ReplayReport {
    let mut running = initial_balance;
    let mut first_broken_entry = None;

    for entry in entries {
        // An entry that overflows the running total can never be valid.
        let next = running.checked_add(entry.signed_amount());
        if first_broken_entry.is_none() && next != Some(entry.resulting_balance) {
            first_broken_entry = Some(entry.id);
        }
        running = next.unwrap_or_else(|| running.saturating_add(entry.signed_amount()));
    }

    ReplayReport {
        account_id,
        initial_balance,
        recorded_balance,
        replayed_balance: running,
        entry_count: entries.len(),
        first_broken_entry,
    }
}
