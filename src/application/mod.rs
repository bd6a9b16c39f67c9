// Application layer: the account repository and the transaction ledger,
// both built over an injected `LedgerStore`.

mod accounts;
pub mod error;
mod ledger;

pub use accounts::*;
pub use error::*;
pub use ledger::*;
