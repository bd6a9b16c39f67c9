use std::time::Duration;

use thiserror::Error;

use crate::domain::{AccountId, Cents};

/// Failure kinds returned by the account repository and the transaction ledger.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Malformed input, rejected before the store is touched.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Account is closed: {0}")]
    AccountClosed(AccountId),

    #[error("Insufficient funds in account {account_id}: balance {balance}, required {required}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Cents,
        required: Cents,
    },

    /// The unit of work failed at the store and was rolled back.
    #[error("Ledger write failed: {0:#}")]
    LedgerWriteFailed(#[source] anyhow::Error),

    /// The unit of work ran past its deadline and was rolled back.
    #[error("Deadline of {0:?} exceeded before commit")]
    DeadlineExceeded(Duration),

    /// A non-exclusive read failed at the store.
    #[error("Store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// Response category a front end maps each failure kind onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    BadRequest,
    NotFound,
    /// The target exists but refuses the operation (closed account).
    Forbidden,
    ServerError,
}

impl LedgerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InvalidArgument(_) | LedgerError::InsufficientFunds { .. } => {
                ErrorClass::BadRequest
            }
            LedgerError::AccountNotFound(_) => ErrorClass::NotFound,
            LedgerError::AccountClosed(_) => ErrorClass::Forbidden,
            LedgerError::LedgerWriteFailed(_)
            | LedgerError::DeadlineExceeded(_)
            | LedgerError::Store(_) => ErrorClass::ServerError,
        }
    }

    /// Whether the caller may safely retry the whole operation.
    /// A retried movement is a new, distinct movement.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::ServerError
    }
}
