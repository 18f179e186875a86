use thiserror::Error;

use crate::model::WithdrawalStatus;

/// Ledger errors.
///
/// `InsufficientFunds` is a domain outcome surfaced to callers;
/// `UnexpectedStatus` is an invariant violation that aborts the enclosing
/// transaction without writing anything.
#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("amount overflows the balance range")]
    AmountOverflow,
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },
    #[error("withdrawal {id} is {actual:?}, expected {expected:?}")]
    UnexpectedWithdrawalStatus {
        id: u64,
        expected: WithdrawalStatus,
        actual: WithdrawalStatus,
    },
    #[error("invalid deposit: {0}")]
    InvalidDeposit(&'static str),
    #[error("amount must be positive")]
    InvalidAmount,
    #[error(transparent)]
    Storage(#[from] ferrox_storage::Error),
}
