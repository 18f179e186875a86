//! # Storage
//!
//! Ordered key/value storage with serializable transactions.
//!
//! The ledger, chain synchronizer and matching engine all require that
//! their multi-row updates commit atomically under serializable isolation,
//! and that a transaction which lost a race is transparently re-run. This
//! crate provides exactly that contract over a pluggable ordered key/value
//! backend:
//!
//! * [`Store::serializable`] runs a closure inside an optimistic
//!   transaction and retries it from scratch whenever the commit-time
//!   validation detects a conflicting committed write (the analogue of a
//!   SQL serialization failure).
//! * [`Store::view`] runs a read-only closure against a consistent
//!   snapshot without commit overhead.
//! * Values are serde types marshalled with bincode; keys are plain byte
//!   strings whose lexicographic order is the scan order, so zero-padded
//!   decimal segments give numeric ordering.
//!
//! Nullable columns are `Option<T>` fields on the stored entities; zero is
//! never a null sentinel.

pub mod backends;
mod error;
mod store;

pub use error::Error;
pub use store::{prefix_end, Store, Tx};

pub type Result<T> = std::result::Result<T, Error>;
