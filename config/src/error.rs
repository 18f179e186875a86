use thiserror::Error;

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not read {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0} must be set")]
    MissingField(String),
    #[error("coin {0} is configured twice")]
    DuplicateCoin(String),
    #[error("coin {0}: {1}")]
    BadCoin(String, &'static str),
    #[error("unknown coin {0}")]
    UnknownCoin(String),
}
