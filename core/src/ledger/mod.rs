//! The two ledgers: the terminal-resident [`LocalLedger`] that keeps a bus
//! running with no network, and the server-resident [`CentralLedger`] that
//! everything reconciles against.
//!
//! Both sit on the encrypted store and speak the same record vocabulary
//! from [`crate::types`]; the difference is authority. The local ledger is
//! an optimistic cache that records intent; the central ledger is the
//! single place where money actually moves.

pub mod central;
pub mod local;

pub use central::{ApplyOutcome, CentralLedger};
pub use local::LocalLedger;

use thiserror::Error;

use crate::store::StoreError;

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A debit would drive the balance negative. User-visible; the
    /// transaction is never recorded.
    #[error("insufficient balance: have {balance}, need {amount}")]
    InsufficientBalance { balance: u64, amount: u64 },

    /// A credit would overflow the balance counter. Only reachable with
    /// absurd amounts, but money code checks its arithmetic.
    #[error("balance overflow applying credit of {amount}")]
    AmountOverflow { amount: u64 },

    /// Storage failure, including the integrity alarm for records that
    /// fail decryption.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A record decrypted fine but did not deserialize. Same severity as
    /// an integrity failure: the ledger cannot be trusted until inspected.
    #[error("corrupt ledger record: {0}")]
    Corrupt(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
