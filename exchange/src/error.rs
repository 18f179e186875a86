use thiserror::Error;

/// Matching engine errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("market {0} does not exist")]
    UnknownMarket(String),
    #[error("invalid order: {0}")]
    InvalidOrder(&'static str),
    #[error("minimum order amount is {min} {coin}")]
    BelowMinTrade { coin: String, min: u64 },
    #[error("order {0} not found")]
    OrderNotFound(u64),
    #[error("the order processor has stopped")]
    EngineStopped,
    #[error("order invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Config(#[from] ferrox_config::Error),
    #[error(transparent)]
    Ledger(#[from] ferrox_ledger::Error),
    #[error(transparent)]
    Storage(#[from] ferrox_storage::Error),
}
