//! One side of a market's in-memory order window.

use std::collections::BTreeMap;

use crate::keys::price_key;
use crate::model::{Order, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BookKey {
    price: u64,
    id: u64,
}

/// Bounded in-memory window over one side's best pending orders. The
/// minimum key is the best order; the maximum is the worst resident one.
pub struct Book {
    side: Side,
    entries: BTreeMap<BookKey, Order>,
}

impl Book {
    pub fn new(side: Side) -> Self {
        Book {
            side,
            entries: BTreeMap::new(),
        }
    }

    fn key(&self, order: &Order) -> BookKey {
        BookKey {
            price: price_key(self.side, order.price),
            id: order.id,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert or replace (fills changed) an order.
    pub fn insert(&mut self, order: Order) {
        self.entries.insert(self.key(&order), order);
    }

    pub fn remove(&mut self, order: &Order) -> Option<Order> {
        self.entries.remove(&self.key(order))
    }

    pub fn pop_worst(&mut self) -> Option<Order> {
        let key = *self.entries.keys().next_back()?;
        self.entries.remove(&key)
    }

    /// Best resident order: highest-priced bid / lowest-priced ask,
    /// oldest first within a price level.
    pub fn best(&self) -> Option<&Order> {
        self.entries.values().next()
    }

    pub fn worst(&self) -> Option<&Order> {
        self.entries.values().next_back()
    }

    /// Whether `a` prices strictly better than `b` on this side.
    pub fn better(&self, a: &Order, b: &Order) -> bool {
        match self.side {
            Side::Bid => a.price > b.price,
            Side::Ask => a.price < b.price,
        }
    }

    /// Orders best-first.
    pub fn iter(&self) -> impl Iterator<Item = &Order> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderStatus;

    fn order(id: u64, side: Side, price: f64) -> Order {
        Order {
            id,
            side,
            user_id: 1,
            coin: "DOGE".into(),
            amount: 100,
            filled: 0,
            basis_coin: "BTC".into(),
            basis_amount: 0,
            basis_filled: 0,
            basis_fee: 0,
            basis_fee_filled: 0,
            basis_fee_ratio: 0.0,
            price,
            status: OrderStatus::Pending,
            time: 0,
            updated: 0,
        }
    }

    #[test]
    fn asks_order_by_price_then_id() {
        let mut book = Book::new(Side::Ask);
        book.insert(order(3, Side::Ask, 2.0));
        book.insert(order(1, Side::Ask, 2.0));
        book.insert(order(2, Side::Ask, 1.5));

        assert_eq!(book.best().unwrap().id, 2);
        assert_eq!(book.worst().unwrap().id, 3);

        let ids: Vec<u64> = book.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[test]
    fn bids_order_by_descending_price_then_id() {
        let mut book = Book::new(Side::Bid);
        book.insert(order(3, Side::Bid, 2.0));
        book.insert(order(1, Side::Bid, 2.0));
        book.insert(order(2, Side::Bid, 2.5));

        let ids: Vec<u64> = book.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(book.pop_worst().unwrap().id, 3);
    }
}
