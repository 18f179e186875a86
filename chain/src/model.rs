//! Chain-side entities: master public keys, derived addresses, recognized
//! payments (UTXOs) and blocks.

use serde::{Deserialize, Serialize};

use crate::rpc::{RpcBlock, RpcPayment};

/// BIP32 chain-path prefix for user deposit addresses (`0/<user idx>`).
pub const CHAINPATH_PREFIX_DEPOSIT: u32 = 0;
/// Chain-path prefix for change addresses.
pub const CHAINPATH_PREFIX_CHANGE: u32 = 1;
/// Chain-path prefix for sweep outputs.
pub const CHAINPATH_PREFIX_SWEEP: u32 = 2;
/// Chain-path prefix for dry-run sweep outputs; throwaway addresses.
pub const CHAINPATH_PREFIX_SWEEP_DRY: u32 = 102;

/// A master public key whose derived addresses we track.
///
/// The `(pub_key, chain)` pair is immutable once stored; re-registering
/// the same public key with a different chain code is a fatal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mpk {
    pub id: u64,
    pub pub_key: String,
    pub chain: String,
}

/// A derived address. Append-only; rows are never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Address {
    pub address: String,
    pub coin: String,
    pub user_id: u64,
    pub wallet: String,
    pub mpk_id: u64,
    pub chain_path: String,
    pub chain_idx: u32,
    pub time: i64,
}

/// Spend lifecycle of a payment: available → checked-out → spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpentStatus {
    Available,
    CheckedOut,
    Spent,
}

/// Whether the payment's containing block is on the main chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanStatus {
    Good,
    Orphaned,
}

/// A recognized transaction output paying one of our addresses.
/// Unique on `(tx_id, vout)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: u64,
    pub coin: String,
    pub tx_id: String,
    pub vout: u32,
    /// Confirming block, absent for mempool payments.
    pub blockhash: Option<String>,
    pub blockheight: Option<u32>,
    pub address: String,
    pub amount: u64,
    pub script_pk: String,
    pub mpk_id: u64,
    pub spent: SpentStatus,
    /// Outbound transaction that spent this payment.
    pub wtx_id: Option<u64>,
    pub orphaned: OrphanStatus,
    pub time: i64,
    pub updated: i64,
}

impl Payment {
    /// Whether this payment can be selected as an input: unspent, on the
    /// main chain, and confirmed at or below `req_height`.
    pub fn spendable_at(&self, req_height: u32) -> bool {
        self.spent == SpentStatus::Available
            && self.orphaned == OrphanStatus::Good
            && self.blockheight.is_some_and(|h| h <= req_height)
    }

    pub fn from_rpc(rpc: &RpcPayment, mpk_id: u64) -> Payment {
        Payment {
            id: 0,
            coin: rpc.coin.clone(),
            tx_id: rpc.tx_id.clone(),
            vout: rpc.vout,
            blockhash: rpc.blockhash.clone(),
            blockheight: rpc.blockheight,
            address: rpc.address.clone(),
            amount: rpc.amount,
            script_pk: rpc.script_pk.clone(),
            mpk_id,
            spent: SpentStatus::Available,
            wtx_id: None,
            orphaned: OrphanStatus::Good,
            time: rpc.time,
            updated: rpc.time,
        }
    }

    pub fn to_rpc(&self) -> RpcPayment {
        RpcPayment {
            coin: self.coin.clone(),
            tx_id: self.tx_id.clone(),
            vout: self.vout,
            blockhash: self.blockhash.clone(),
            blockheight: self.blockheight,
            address: self.address.clone(),
            amount: self.amount,
            script_pk: self.script_pk.clone(),
            time: self.time,
        }
    }
}

/// Block ingestion state machine.
///
/// ```text
/// (new) ──────────────▶ Processing ──▶ Good ──▶ GoodCredited
///                          ▲  ▲          │            │
///                          │  └──────────┴────────────┘
///                       Orphaned ◀── (hash mismatch at height)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockStatus {
    /// All payments saved and on the main chain.
    Good,
    /// Transitioning between good and orphaned; payments in flux.
    Processing,
    /// Off the main chain; all payments orphaned.
    Orphaned,
    /// Good, and deposits were credited at confirmation depth.
    GoodCredited,
}

/// A tracked block. The hash is the primary key; height is only unique
/// among non-orphaned blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub coin: String,
    pub height: u32,
    pub hash: String,
    pub status: BlockStatus,
    pub time: i64,
    pub updated: i64,
}

impl Block {
    /// Build a block row from a node header. A zero `time` is kept as-is;
    /// the synchronizer fills it from `time_for_block` before saving.
    pub fn from_rpc(rpc: &RpcBlock, status: BlockStatus) -> Block {
        Block {
            coin: rpc.coin.clone(),
            height: rpc.height,
            hash: rpc.hash.clone(),
            status,
            time: rpc.time,
            updated: ferrox_util::now(),
        }
    }
}
