//! Ledger entities. Amount fields on deposits/withdrawals are unsigned
//! base units; balance amounts are signed because the system change wallet
//! may go transiently negative.

use serde::{Deserialize, Serialize};

/// Spendable funds.
pub const WALLET_MAIN: &str = "main";
/// Funds reserved for open orders.
pub const WALLET_RESERVED_ORDER: &str = "reserved_o";
/// Funds reserved for pending withdrawals.
pub const WALLET_RESERVED_WITHDRAWAL: &str = "reserved_w";
/// Funds being swept to another master key.
pub const WALLET_SWEEP: &str = "sweep";
/// Dry-run sweep funds; the addresses are throwaway.
pub const WALLET_SWEEP_DRY: &str = "sweep_dry";
/// On-chain change owed back to the hot wallet; owned by the system user
/// and transiently negative between broadcast and change confirmation.
pub const WALLET_CHANGE: &str = "change";

/// User id owning system wallets such as `change` and sweep outputs.
pub const SYSTEM_USER: u64 = 0;

/// A user's balance in one wallet for one coin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: u64,
    pub wallet: String,
    pub coin: String,
    pub amount: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositKind {
    Crypto,
    Fiat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositStatus {
    Pending,
    Credited,
}

/// An incoming payment awaiting (or having received) credit.
///
/// Crypto deposits always reference the recognized on-chain payment;
/// fiat deposits never do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: u64,
    pub kind: DepositKind,
    pub user_id: u64,
    pub wallet: String,
    pub coin: String,
    pub amount: u64,
    pub payment_id: Option<u64>,
    pub status: DepositStatus,
    pub time: i64,
    pub updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalStatus {
    Pending,
    CheckedOut,
    Complete,
    Stalled,
    Canceled,
}

impl WithdrawalStatus {
    /// Key segment for the per-status scan index.
    pub fn as_str(self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::CheckedOut => "checked_out",
            WithdrawalStatus::Complete => "complete",
            WithdrawalStatus::Stalled => "stalled",
            WithdrawalStatus::Canceled => "canceled",
        }
    }
}

/// A user-requested outbound payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: u64,
    pub user_id: u64,
    pub wallet: String,
    pub coin: String,
    pub to_address: String,
    pub amount: u64,
    /// Reserved; never set. Kept for schema compatibility.
    pub approved: i32,
    pub status: WithdrawalStatus,
    /// Outbound transaction that completed this withdrawal.
    pub wtx_id: Option<u64>,
    pub time: i64,
    pub updated: i64,
}

/// A wallet-to-wallet move between users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub id: u64,
    pub user_id: u64,
    pub wallet: String,
    pub to_user_id: u64,
    pub to_wallet: String,
    pub coin: String,
    pub amount: u64,
    pub fee: u64,
    pub time: i64,
}
