//! Outbound transaction bookkeeping. Spent payments reference their
//! outbound row, so every input spend is explained.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundKind {
    /// User withdrawal.
    Withdrawal,
    /// Hot-to-cold consolidation.
    Sweep,
}

/// A signed transaction this process constructed and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundTx {
    pub id: u64,
    pub kind: OutboundKind,
    pub coin: String,
    pub from_mpk_id: Option<u64>,
    pub to_mpk_id: Option<u64>,
    /// Sum of the requested outputs, before change and fees.
    pub amount: u64,
    pub miner_fee: u64,
    pub chg_address: String,
    pub raw_tx: String,
    pub tx_id: String,
    pub time: i64,
}

pub(crate) fn wtx_key(id: u64) -> Vec<u8> {
    format!("wtx/id/{id:020}").into_bytes()
}
