use thiserror::Error;

/// Storage errors.
///
/// `Conflict` is consumed by the [`Store::serializable`](crate::Store::serializable)
/// retry loop and should never reach domain code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serializable transaction conflict")]
    Conflict,
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("row codec failed: {0}")]
    Codec(#[from] bincode::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}
