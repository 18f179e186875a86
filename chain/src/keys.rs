//! Storage keys for chain rows and their scan indexes.

macro_rules! bytes {
    ($($arg:tt)*) => {
        format!($($arg)*).into_bytes()
    }
}

pub fn mpk(id: u64) -> Vec<u8> {
    bytes!("mpk/id/{id:020}")
}

pub fn mpk_by_pubkey(pub_key: &str) -> Vec<u8> {
    bytes!("mpk/pubkey/{pub_key}")
}

pub fn address(address: &str) -> Vec<u8> {
    bytes!("address/addr/{address}")
}

/// Per-(user, wallet, coin) index ordered by derivation index; a reverse
/// scan of the prefix yields the most recently derived address first.
pub fn address_by_wallet(user_id: u64, wallet: &str, coin: &str, chain_idx: u32) -> Vec<u8> {
    bytes!("address/wallet/{user_id:020}/{wallet}/{coin}/{chain_idx:010}")
}

pub fn address_by_wallet_prefix(user_id: u64, wallet: &str, coin: &str) -> Vec<u8> {
    bytes!("address/wallet/{user_id:020}/{wallet}/{coin}/")
}

/// Uniqueness index for `(mpk, coin, path, index)`; also serves max-index
/// lookups via a reverse scan.
pub fn address_by_derivation(mpk_id: u64, coin: &str, chain_path: &str, chain_idx: u32) -> Vec<u8> {
    bytes!("address/derived/{mpk_id:020}/{coin}/{chain_path}/{chain_idx:010}")
}

pub fn address_by_derivation_prefix(mpk_id: u64, coin: &str, chain_path: &str) -> Vec<u8> {
    bytes!("address/derived/{mpk_id:020}/{coin}/{chain_path}/")
}

pub fn payment(id: u64) -> Vec<u8> {
    bytes!("payment/id/{id:020}")
}

pub fn payment_by_outpoint(tx_id: &str, vout: u32) -> Vec<u8> {
    bytes!("payment/outpoint/{tx_id}/{vout:010}")
}

pub fn payment_by_block(blockhash: &str, id: u64) -> Vec<u8> {
    bytes!("payment/block/{blockhash}/{id:020}")
}

pub fn payment_by_block_prefix(blockhash: &str) -> Vec<u8> {
    bytes!("payment/block/{blockhash}/")
}

/// Index of unspent, unorphaned, confirmed-or-pending payments ordered by
/// amount then id. Confirmation depth is filtered at query time.
pub fn payment_spendable(mpk_id: u64, coin: &str, amount: u64, id: u64) -> Vec<u8> {
    bytes!("payment/spendable/{mpk_id:020}/{coin}/{amount:020}/{id:020}")
}

pub fn payment_spendable_prefix(mpk_id: u64, coin: &str) -> Vec<u8> {
    bytes!("payment/spendable/{mpk_id:020}/{coin}/")
}

pub fn payment_spendable_amount(mpk_id: u64, coin: &str, amount: u64) -> Vec<u8> {
    bytes!("payment/spendable/{mpk_id:020}/{coin}/{amount:020}")
}

pub fn block(hash: &str) -> Vec<u8> {
    bytes!("block/hash/{hash}")
}

/// Height index over non-orphaned blocks only; at most one active block
/// per height.
pub fn block_at_height(coin: &str, height: u32) -> Vec<u8> {
    bytes!("block/height/{coin}/{height:010}")
}

pub fn block_height_prefix(coin: &str) -> Vec<u8> {
    bytes!("block/height/{coin}/")
}
