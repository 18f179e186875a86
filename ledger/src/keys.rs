//! Storage keys for ledger rows. Numeric segments are zero-padded decimal
//! so that lexicographic key order is numeric order.

use crate::model::WithdrawalStatus;

macro_rules! bytes {
    ($($arg:tt)*) => {
        format!($($arg)*).into_bytes()
    }
}

pub fn balance(user_id: u64, wallet: &str, coin: &str) -> Vec<u8> {
    bytes!("balance/{user_id:020}/{wallet}/{coin}")
}

pub fn balances_by_wallet(user_id: u64, wallet: &str) -> Vec<u8> {
    bytes!("balance/{user_id:020}/{wallet}/")
}

pub fn deposit(id: u64) -> Vec<u8> {
    bytes!("deposit/id/{id:020}")
}

pub fn deposit_by_user(user_id: u64, id: u64) -> Vec<u8> {
    bytes!("deposit/user/{user_id:020}/{id:020}")
}

pub fn deposit_by_user_prefix(user_id: u64) -> Vec<u8> {
    bytes!("deposit/user/{user_id:020}/")
}

pub fn deposit_by_payment(payment_id: u64) -> Vec<u8> {
    bytes!("deposit/payment/{payment_id:020}")
}

pub fn withdrawal(id: u64) -> Vec<u8> {
    bytes!("withdrawal/id/{id:020}")
}

pub fn withdrawal_by_user(user_id: u64, id: u64) -> Vec<u8> {
    bytes!("withdrawal/user/{user_id:020}/{id:020}")
}

pub fn withdrawal_by_user_prefix(user_id: u64) -> Vec<u8> {
    bytes!("withdrawal/user/{user_id:020}/")
}

pub fn withdrawal_status(coin: &str, status: WithdrawalStatus, id: u64) -> Vec<u8> {
    bytes!("withdrawal/status/{coin}/{}/{id:020}", status.as_str())
}

pub fn withdrawal_status_prefix(coin: &str, status: WithdrawalStatus) -> Vec<u8> {
    bytes!("withdrawal/status/{coin}/{}/", status.as_str())
}

pub fn transfer(id: u64) -> Vec<u8> {
    bytes!("transfer/id/{id:020}")
}
