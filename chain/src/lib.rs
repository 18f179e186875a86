//! # Chain
//!
//! Everything between the node RPC boundary and the ledger: the master
//! key and address registry, the payment (UTXO) and block stores, and the
//! per-coin chain synchronizer that turns on-chain reality into credited
//! deposits, and un-credits them again when a reorg takes a block away.

pub mod blocks;
mod error;
mod keys;
pub mod model;
pub mod payments;
pub mod registry;
pub mod rpc;
pub mod sync;
pub mod testing;


pub use error::Error;
pub use model::{
    Address, Block, BlockStatus, Mpk, OrphanStatus, Payment, SpentStatus,
    CHAINPATH_PREFIX_CHANGE, CHAINPATH_PREFIX_DEPOSIT, CHAINPATH_PREFIX_SWEEP,
    CHAINPATH_PREFIX_SWEEP_DRY,
};
pub use sync::ChainSync;

pub type Result<T> = std::result::Result<T, Error>;
