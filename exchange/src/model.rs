//! Orders, trades and price log rows.
//!
//! All quantities are integer base units. Prices are `f64` and compared
//! by equality for price/time priority; conversions between amount and
//! basis round half up.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Bid => "bid",
            Side::Ask => "ask",
        }
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Complete,
    Canceled,
}

/// A limit order.
///
/// Bids are limited by `basis_amount` (quote currency spent); asks by
/// `amount` (coin sold). The other limit may also be set, in which case
/// whichever binds first completes the order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub side: Side,
    pub user_id: u64,
    pub coin: String,
    pub amount: u64,
    pub filled: u64,
    pub basis_coin: String,
    pub basis_amount: u64,
    pub basis_filled: u64,
    /// Fee budget reserved up front, in basis units.
    pub basis_fee: u64,
    pub basis_fee_filled: u64,
    pub basis_fee_ratio: f64,
    pub price: f64,
    pub status: OrderStatus,
    pub time: i64,
    pub updated: i64,
}

impl Order {
    pub fn market_name(&self) -> String {
        format!("{}/{}", self.coin, self.basis_coin)
    }

    /// An order is complete once either configured limit is reached.
    pub fn is_complete(&self) -> bool {
        (self.amount > 0 && self.amount == self.filled)
            || (self.basis_amount > 0 && self.basis_amount == self.basis_filled)
    }

    /// Internal consistency checks, run before and after every mutation
    /// that reaches storage.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Invariant(format!("[order {}] {msg}", self.id)));

        if self.amount > 0 && self.amount < self.filled {
            return fail(format!("filled {} exceeds amount {}", self.filled, self.amount));
        }
        if self.basis_amount > 0 && self.basis_amount < self.basis_filled {
            return fail(format!(
                "basis filled {} exceeds basis amount {}",
                self.basis_filled, self.basis_amount
            ));
        }
        if self.basis_fee < self.basis_fee_filled {
            return fail(format!(
                "fee filled {} exceeds fee budget {}",
                self.basis_fee_filled, self.basis_fee
            ));
        }
        match self.side {
            Side::Bid => {
                if self.basis_amount == 0 {
                    return fail("bid without basis amount".to_string());
                }
            }
            Side::Ask => {
                if self.amount == 0 {
                    return fail("ask without amount".to_string());
                }
            }
        }
        if self.is_complete() && self.status != OrderStatus::Complete {
            return fail("complete order not marked complete".to_string());
        }
        Ok(())
    }

    fn remaining(limit: u64, filled: u64) -> u64 {
        if limit > 0 {
            limit - filled
        } else {
            u64::MAX
        }
    }

    /// How much can trade between this order and `other` at `other`'s
    /// price: `(trade_amount, trade_basis)` with
    /// `trade_basis = round(trade_amount × price)` and neither side's
    /// remaining limits exceeded. A missing limit (zero) is unbounded.
    pub fn compute_trade(&self, other: &Order) -> (u64, u64) {
        let price = other.price;

        let amount_rem = Self::remaining(self.amount, self.filled)
            .min(Self::remaining(other.amount, other.filled));
        let basis_rem = Self::remaining(self.basis_amount, self.basis_filled)
            .min(Self::remaining(other.basis_amount, other.basis_filled));

        if amount_rem != u64::MAX {
            let basis_for_amount = (amount_rem as f64 * price + 0.5) as u64;
            if basis_rem == u64::MAX || basis_rem >= basis_for_amount {
                (amount_rem, basis_for_amount)
            } else {
                let amount_for_basis = (basis_rem as f64 / price + 0.5) as u64;
                if amount_for_basis > amount_rem {
                    (amount_rem, basis_rem)
                } else {
                    (amount_for_basis, basis_rem)
                }
            }
        } else {
            let amount_for_basis = (basis_rem as f64 / price + 0.5) as u64;
            (amount_for_basis, basis_rem)
        }
    }

    /// Trade size plus each side's fee, clamped to its remaining budget.
    pub fn compute_trade_and_fees(&self, other: &Order) -> Result<(u64, u64, u64, u64)> {
        let (trade_amount, trade_basis) = self.compute_trade(other);
        let (bid, ask) = self.sort_bid_ask(other)?;
        let bid_fee =
            ((bid.basis_fee_ratio * trade_basis as f64 + 0.5) as u64).min(bid.fee_remaining());
        let ask_fee =
            ((ask.basis_fee_ratio * trade_basis as f64 + 0.5) as u64).min(ask.fee_remaining());
        Ok((trade_amount, trade_basis, bid_fee, ask_fee))
    }

    pub fn fee_remaining(&self) -> u64 {
        self.basis_fee - self.basis_fee_filled
    }

    pub fn sort_bid_ask<'a>(&'a self, other: &'a Order) -> Result<(&'a Order, &'a Order)> {
        match (self.side, other.side) {
            (Side::Bid, Side::Ask) => Ok((self, other)),
            (Side::Ask, Side::Bid) => Ok((other, self)),
            _ => Err(Error::Invariant(format!(
                "cannot match two {}s",
                self.side.as_str()
            ))),
        }
    }
}

/// An executed trade between a bid and an ask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: u64,
    pub bid_user_id: u64,
    pub bid_order_id: u64,
    pub bid_basis_fee: u64,
    pub ask_user_id: u64,
    pub ask_order_id: u64,
    pub ask_basis_fee: u64,
    pub coin: String,
    pub basis_coin: String,
    pub trade_amount: u64,
    pub trade_basis: u64,
    pub price: f64,
    pub time: i64,
}

/// One OHLC bucket of one interval. Unique on `(market, interval, time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLog {
    pub id: u64,
    pub market: String,
    pub low: f64,
    pub high: f64,
    pub open: f64,
    pub close: f64,
    /// Bucket width in seconds.
    pub interval: i64,
    pub ask_volume: u64,
    pub bid_volume: u64,
    /// Bucket start, rounded down to the interval.
    pub time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn order(side: Side, amount: u64, basis_amount: u64, price: f64) -> Order {
        Order {
            id: 0,
            side,
            user_id: 1,
            coin: "DOGE".into(),
            amount,
            filled: 0,
            basis_coin: "BTC".into(),
            basis_amount,
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
    fn compute_trade_covers_the_limit_matrix() {
        let check = |order: Order, other: Order, amount: u64, basis: u64| {
            assert_eq!(order.compute_trade(&other), (amount, basis));
        };

        // A market ask against a resting bid.
        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 0, 90, 1.0), 90, 90);

        check(order(Side::Bid, 0, 100, 0.0), order(Side::Ask, 200, 0, 1.0), 100, 100);
        check(order(Side::Bid, 0, 100, 0.0), order(Side::Ask, 50, 0, 1.0), 50, 50);
        check(order(Side::Bid, 0, 100, 0.0), order(Side::Ask, 50, 0, 0.5), 50, 25);

        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 0, 200, 1.0), 100, 100);
        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 0, 50, 1.0), 50, 50);
        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 0, 50, 0.5), 100, 50);

        // Mixed limits on both sides.
        check(order(Side::Ask, 100, 50, 0.0), order(Side::Bid, 200, 200, 1.0), 50, 50);
        let mut partially = order(Side::Ask, 100, 50, 0.0);
        partially.filled = 60;
        check(partially.clone(), order(Side::Bid, 200, 200, 1.0), 40, 40);
        partially.basis_filled = 30;
        check(partially, order(Side::Bid, 200, 200, 1.0), 20, 20);

        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 0, 200, 2.0), 100, 200);
        check(order(Side::Ask, 90, 0, 0.0), order(Side::Bid, 0, 200, 2.0), 90, 180);
        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 0, 190, 2.0), 95, 190);
        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 96, 190, 2.0), 95, 190);
        check(order(Side::Ask, 100, 0, 0.0), order(Side::Bid, 94, 190, 2.0), 94, 188);

        check(order(Side::Bid, 0, 100, 0.0), order(Side::Ask, 200, 0, 2.0), 50, 100);
        check(order(Side::Bid, 0, 100, 0.0), order(Side::Ask, 200, 0, 0.5), 200, 100);
        check(order(Side::Bid, 199, 100, 0.0), order(Side::Ask, 200, 0, 0.5), 199, 100);
    }

    #[test]
    fn fees_are_clamped_to_the_remaining_budget() {
        let mut bid = order(Side::Bid, 0, 1_000, 2.0);
        bid.basis_fee = 5;
        bid.basis_fee_ratio = 0.01;
        bid.basis_fee_filled = 3;
        let ask = order(Side::Ask, 500, 0, 2.0);

        let (amount, basis, bid_fee, ask_fee) = bid.compute_trade_and_fees(&ask).unwrap();
        assert_eq!((amount, basis), (500, 1_000));
        // round(0.01 * 1000) = 10, clamped to the remaining 2.
        assert_eq!(bid_fee, 2);
        assert_eq!(ask_fee, 0);
    }

    #[test]
    fn completion_honours_either_limit() {
        let mut ask = order(Side::Ask, 100, 0, 1.0);
        assert!(!ask.is_complete());
        ask.filled = 100;
        assert!(ask.is_complete());

        let mut bid = order(Side::Bid, 0, 80, 1.0);
        bid.basis_filled = 80;
        assert!(bid.is_complete());
    }
}
