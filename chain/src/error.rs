use thiserror::Error;

use crate::model::{BlockStatus, SpentStatus};

/// Chain-side errors.
///
/// `Invariant` marks conditions that should be impossible while this
/// process is the only writer of blocks and payments for its coin; the
/// worker surfaces them as operator alerts.
#[derive(Debug, Error)]
pub enum Error {
    #[error("master key {0} already registered with a different chain code")]
    MpkChainMismatch(String),
    #[error("block {hash} is {actual:?}, expected {expected:?}")]
    UnexpectedBlockStatus {
        hash: String,
        expected: BlockStatus,
        actual: BlockStatus,
    },
    #[error("payment {id} is {actual:?}, expected {expected:?}")]
    UnexpectedSpentStatus {
        id: u64,
        expected: SpentStatus,
        actual: SpentStatus,
    },
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error(transparent)]
    Rpc(#[from] crate::rpc::RpcError),
    #[error(transparent)]
    Derivation(#[from] ferrox_crypto::Error),
    #[error(transparent)]
    Ledger(#[from] ferrox_ledger::Error),
    #[error(transparent)]
    Storage(#[from] ferrox_storage::Error),
}
