//! The node RPC capability.
//!
//! The synchronizer and treasury program against [`ChainRpc`]; concrete
//! clients (bitcoind-style JSON-RPC, simulators) live outside this crate.
//! Implementations are expected to apply bounded timeouts; a hung call
//! stalls the whole per-coin worker.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ferrox_protected::Protected;
use thiserror::Error;

/// A transaction output of kind `pubkey`/`pubkeyhash` as reported by the
/// node, before we know whether the address is ours.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcPayment {
    pub coin: String,
    pub tx_id: String,
    pub vout: u32,
    pub blockhash: Option<String>,
    pub blockheight: Option<u32>,
    pub address: String,
    /// Base units.
    pub amount: u64,
    pub script_pk: String,
    pub time: i64,
}

/// A block header as reported by the node.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcBlock {
    pub coin: String,
    pub height: u32,
    pub hash: String,
    pub time: i64,
}

#[derive(Debug, Error)]
pub enum RpcError {
    /// The transaction is spent or not indexed; mempool ingestion skips
    /// these.
    #[error("transaction unavailable: {0}")]
    TxUnavailable(String),
    #[error("rpc transport failed: {0}")]
    Transport(String),
    #[error("rpc protocol error: {0}")]
    Protocol(String),
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Node RPC surface used by the synchronizer and treasury.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current chain tip height.
    async fn tip_height(&self, coin: &str) -> RpcResult<u32>;

    /// Header of the main-chain block at `height`, or `None` when the tip
    /// is below `height`.
    async fn block_at(&self, coin: &str, height: u32) -> RpcResult<Option<RpcBlock>>;

    /// Main-chain headers for heights `lo..=hi`, ascending.
    async fn blocks_between(&self, coin: &str, lo: u32, hi: u32) -> RpcResult<Vec<RpcBlock>>;

    /// Timestamp of a block.
    async fn time_for_block(&self, coin: &str, hash: &str) -> RpcResult<i64>;

    /// All pay-to-pubkey(-hash) outputs of the transactions in a block.
    async fn payments_for_block(&self, coin: &str, hash: &str) -> RpcResult<Vec<RpcPayment>>;

    /// All pay-to-pubkey(-hash) outputs of one transaction.
    async fn payments_for_tx(&self, coin: &str, tx_id: &str) -> RpcResult<Vec<RpcPayment>>;

    /// Txids currently in the node mempool.
    async fn mempool_tx_ids(&self, coin: &str) -> RpcResult<Vec<String>>;

    /// Build and sign a raw transaction spending `inputs` into `outputs`.
    /// `priv_keys` are WIF-encoded signing keys for the input addresses.
    /// Returns the signed transaction hex.
    async fn create_signed_raw_transaction(
        &self,
        coin: &str,
        inputs: &[RpcPayment],
        outputs: &BTreeMap<String, u64>,
        priv_keys: &[Protected],
    ) -> RpcResult<String>;

    /// Broadcast a signed raw transaction.
    async fn send_raw_transaction(&self, coin: &str, raw_hex: &str) -> RpcResult<()>;
}
