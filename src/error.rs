//! Engine error taxonomy.
//!
//! Precondition errors are the caller's fault and leave state untouched.
//! `Overflow` and `LockUnderflow` signal arithmetic trouble; they also reject
//! the operation cleanly. `InvariantViolation` is a bug — the checker aborts
//! on it in debug and test builds.

use thiserror::Error;

use crate::fixed::Credits;
use crate::models::{AccountId, LockId, MarketId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("invalid precision: {0}")]
    InvalidPrecision(String),

    #[error("unknown outcome: {0}")]
    UnknownOutcome(String),

    #[error("invalid outcomes: {0}")]
    InvalidOutcomes(String),

    #[error("market {0} is not open")]
    MarketNotOpen(MarketId),

    #[error("market {0} not found")]
    MarketNotFound(MarketId),

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("lock {0} not found")]
    LockNotFound(LockId),

    #[error("account {account}: need {needed} credit units, have {available} available")]
    InsufficientBalance {
        account: AccountId,
        needed: Credits,
        available: Credits,
    },

    #[error("account {account}: holds {held} units of {outcome}, cannot sell {requested}")]
    InsufficientPosition {
        account: AccountId,
        outcome: String,
        held: i128,
        requested: i128,
    },

    #[error("cost {cost} credit units exceeds budget cap {cap}")]
    BudgetExceeded { cost: Credits, cap: Credits },

    #[error("subsidy cannot cover {needed} credit units (has {available})")]
    InsufficientSubsidy { needed: Credits, available: Credits },

    #[error("lock {lock}: cannot release {requested} of {held} credit units")]
    LockUnderflow {
        lock: LockId,
        held: Credits,
        requested: Credits,
    },

    #[error("arithmetic overflow: {0}")]
    Overflow(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
