//! Storage keys for exchange rows.
//!
//! The book index key embeds a side-aware, order-preserving encoding of
//! the price so that an ascending key scan walks orders best-first:
//! ascending price for asks, descending for bids, id ascending within a
//! price level (price/time priority).

use crate::model::Side;

macro_rules! bytes {
    ($($arg:tt)*) => {
        format!($($arg)*).into_bytes()
    }
}

/// Total-order encoding of a price for one side of the book. Smaller key
/// = better order.
pub fn price_key(side: Side, price: f64) -> u64 {
    let bits = price.to_bits();
    // Standard sortable-double trick; prices are validated positive but
    // the encoding stays total over all floats.
    let ascending = if price >= 0.0 {
        bits | 0x8000_0000_0000_0000
    } else {
        !bits
    };
    match side {
        Side::Ask => ascending,
        Side::Bid => !ascending,
    }
}

pub fn order(id: u64) -> Vec<u8> {
    bytes!("order/id/{id:020}")
}

pub fn order_prefix() -> Vec<u8> {
    bytes!("order/id/")
}

pub fn book_entry(market: &str, side: Side, price: f64, id: u64) -> Vec<u8> {
    bytes!(
        "order/book/{market}/{}/{:016x}/{id:020}",
        side.as_str(),
        price_key(side, price)
    )
}

pub fn book_prefix(market: &str, side: Side) -> Vec<u8> {
    bytes!("order/book/{market}/{}/", side.as_str())
}

pub fn terminal_entry(market: &str, id: u64) -> Vec<u8> {
    bytes!("order/terminal/{market}/{id:020}")
}

pub fn terminal_prefix(market: &str) -> Vec<u8> {
    bytes!("order/terminal/{market}/")
}

pub fn trade(id: u64) -> Vec<u8> {
    bytes!("trade/id/{id:020}")
}

pub fn price_log(market: &str, interval: i64, time: i64) -> Vec<u8> {
    bytes!("pricelog/{market}/{interval:010}/{time:020}")
}

pub fn price_log_interval_prefix(market: &str, interval: i64) -> Vec<u8> {
    bytes!("pricelog/{market}/{interval:010}/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_keys_ascend_with_price() {
        assert!(price_key(Side::Ask, 1.0) < price_key(Side::Ask, 2.0));
        assert!(price_key(Side::Ask, 0.001) < price_key(Side::Ask, 1000.0));
    }

    #[test]
    fn bid_keys_descend_with_price() {
        assert!(price_key(Side::Bid, 2.0) < price_key(Side::Bid, 1.0));
        assert!(price_key(Side::Bid, 1000.0) < price_key(Side::Bid, 0.001));
    }
}
