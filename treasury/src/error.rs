use thiserror::Error;

/// Treasury errors. Failures before broadcast are recoverable: the
/// worker stalls the checked-out withdrawals and the operator resumes
/// them once the cause (usually liquidity) is fixed.
#[derive(Debug, Error)]
pub enum Error {
    #[error("hot master private key for {0} has not been injected")]
    MissingHotKey(String),
    #[error("too many inputs required to gather {needed}")]
    TooManyInputs { needed: u64 },
    #[error("unable to gather enough inputs for {needed}")]
    InsufficientInputs { needed: u64 },
    #[error("transaction requires {required} base fees (max {max})")]
    FeeOverrun { required: usize, max: usize },
    #[error("derived private key does not match address {0}")]
    KeyMismatch(String),
    #[error("sweep output constraints cannot be satisfied for total {total}")]
    SweepUnsatisfiable { total: u64 },
    #[error("sweep inputs total {got}, need at least {needed}")]
    SweepTooSmall { needed: u64, got: u64 },
    #[error("minimum sweep input must cover the miner fee {0}")]
    MinInputBelowFee(u64),
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Chain(#[from] ferrox_chain::Error),
    #[error(transparent)]
    Rpc(#[from] ferrox_chain::rpc::RpcError),
    #[error(transparent)]
    Derivation(#[from] ferrox_crypto::Error),
    #[error(transparent)]
    Ledger(#[from] ferrox_ledger::Error),
    #[error(transparent)]
    Storage(#[from] ferrox_storage::Error),
}
