//! A market: two bounded in-memory books, the matching loop, and the
//! settlement that turns reserves into credited balances.

use ferrox_ledger::{self as ledger, WALLET_MAIN, WALLET_RESERVED_ORDER};
use ferrox_storage::{Store, Tx};

use crate::book::Book;
use crate::model::{Order, OrderStatus, Side, Trade};
use crate::price_log::PriceLogger;
use crate::{orders, Error, Result, MAX_MEMPOOL, MIN_MEMPOOL};

/// How many orders a side reloads from storage when its window drains.
const LOAD_CHUNK: usize = (MAX_MEMPOOL - MIN_MEMPOOL) / 2;

pub struct Market {
    coin: String,
    basis_coin: String,
    name: String,
    bids: Book,
    asks: Book,
    has_more_bids: bool,
    has_more_asks: bool,
    price_logger: PriceLogger,
    store: Store,
}

impl Market {
    /// Load a market from storage: fill both book windows up to the last
    /// terminal order id, then replay pending orders placed after it,
    /// since those may never have reached the processor before the last
    /// shutdown.
    pub fn open(store: Store, basis_coin: &str, coin: &str) -> Result<Market> {
        let name = format!("{coin}/{basis_coin}");
        let initial = (MIN_MEMPOOL + MAX_MEMPOOL) / 2;

        let last_terminal = store.view(|tx| orders::last_terminal_order_id(tx, &name))?;
        let (bid_orders, has_more_bids) = store.view(|tx| {
            orders::load_book_orders(tx, &name, Side::Bid, initial, None, last_terminal)
        })?;
        let (ask_orders, has_more_asks) = store.view(|tx| {
            orders::load_book_orders(tx, &name, Side::Ask, initial, None, last_terminal)
        })?;

        let mut market = Market {
            coin: coin.to_string(),
            basis_coin: basis_coin.to_string(),
            name: name.clone(),
            bids: Book::new(Side::Bid),
            asks: Book::new(Side::Ask),
            has_more_bids,
            has_more_asks,
            price_logger: PriceLogger::open(store.clone(), &name)?,
            store,
        };
        for order in bid_orders {
            market.bids.insert(order);
        }
        for order in ask_orders {
            market.asks.insert(order);
        }

        let replay = market
            .store
            .view(|tx| orders::load_pending_since(tx, &name, last_terminal + 1))?;
        if !replay.is_empty() {
            log::info!(
                "[{}] processing {} orders from last shutdown",
                name,
                replay.len()
            );
            for order in replay {
                market.process_order(order)?;
            }
            log::info!("[{}] done processing", name);
        }
        Ok(market)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Highest resident bid price, 0 when no bids.
    pub fn best_bid_price(&self) -> f64 {
        self.bids.best().map(|o| o.price).unwrap_or(0.0)
    }

    /// Lowest resident ask price, 0 when no asks.
    pub fn best_ask_price(&self) -> f64 {
        self.asks.best().map(|o| o.price).unwrap_or(0.0)
    }

    pub fn last_price(&self) -> f64 {
        self.price_logger.last_price()
    }

    pub fn book(&self, side: Side) -> &Book {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    fn book_mut(&mut self, side: Side) -> &mut Book {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    pub fn has_more(&self, side: Side) -> bool {
        match side {
            Side::Bid => self.has_more_bids,
            Side::Ask => self.has_more_asks,
        }
    }

    fn set_has_more(&mut self, side: Side, value: bool) {
        match side {
            Side::Bid => self.has_more_bids = value,
            Side::Ask => self.has_more_asks = value,
        }
    }

    /// Execute a saved order against the opposite book until it is
    /// complete or no longer crosses, then park the remainder in its own
    /// book. Returns the final state of the order.
    pub fn process_order(&mut self, mut order: Order) -> Result<Order> {
        if order.id == 0 {
            return Err(Error::Invariant("order has not been saved yet".to_string()));
        }
        if order.is_complete() {
            return Err(Error::Invariant(format!(
                "new order {} is already complete",
                order.id
            )));
        }

        loop {
            let Some(mut matched) = self.next_match(&order) else {
                self.insert_if_in_range(order.clone());
                return Ok(order);
            };
            if matched.is_complete() {
                return Err(Error::Invariant(format!(
                    "match {} is already complete",
                    matched.id
                )));
            }

            let (trade_amount, trade_basis, bid_fee, ask_fee) =
                order.compute_trade_and_fees(&matched)?;
            let price = matched.price;

            {
                let (bid, ask) = match order.side {
                    Side::Bid => (&mut order, &mut matched),
                    Side::Ask => (&mut matched, &mut order),
                };
                bid.filled += trade_amount;
                bid.basis_filled += trade_basis;
                bid.basis_fee_filled += bid_fee;
                ask.filled += trade_amount;
                ask.basis_filled += trade_basis;
                ask.basis_fee_filled += ask_fee;
            }
            if order.is_complete() {
                order.status = OrderStatus::Complete;
            }
            if matched.is_complete() {
                matched.status = OrderStatus::Complete;
            }
            order.validate()?;
            matched.validate()?;
            if ask_fee > trade_basis {
                return Err(Error::Invariant("ask fee exceeds trade basis".to_string()));
            }
            if !order.is_complete() && !matched.is_complete() {
                return Err(Error::Invariant(
                    "neither side was fulfilled by the trade".to_string(),
                ));
            }

            let (bid, ask) = order.sort_bid_ask(&matched)?;
            let trade = Trade {
                id: 0,
                bid_user_id: bid.user_id,
                bid_order_id: bid.id,
                bid_basis_fee: bid_fee,
                ask_user_id: ask.user_id,
                ask_order_id: ask.id,
                ask_basis_fee: ask_fee,
                coin: self.coin.clone(),
                basis_coin: self.basis_coin.clone(),
                trade_amount,
                trade_basis,
                price,
                time: ferrox_util::now(),
            };
            let trade_time = trade.time;
            self.settle_trade(&order, &matched, trade)?;

            self.price_logger
                .add_trade(order.side, trade_amount, price, trade_time)?;

            if matched.is_complete() {
                let side = matched.side;
                self.book_mut(side).remove(&matched);
                self.load_more(side, order.id)?;
            } else {
                // Keep the resident copy's fills in step.
                let side = matched.side;
                self.book_mut(side).insert(matched);
            }
            if order.is_complete() {
                return Ok(order);
            }
        }
    }

    /// Cancel by id. Idempotent: a second cancel (or canceling a filled
    /// order) returns the terminal order untouched.
    pub fn cancel_order(&mut self, order_id: u64) -> Result<Order> {
        let order = self.store.view(|tx| orders::load_order(tx, order_id))?;
        if order.market_name() != self.name {
            return Err(Error::UnknownMarket(order.market_name()));
        }
        match order.status {
            OrderStatus::Complete | OrderStatus::Canceled => return Ok(order),
            OrderStatus::Pending => {}
        }

        if self.book_mut(order.side).remove(&order).is_some() {
            self.load_more(order.side, order.id)?;
        }

        self.store.serializable(|tx| {
            let mut current = orders::load_order(tx, order_id)?;
            if current.status != OrderStatus::Pending {
                return Ok(current);
            }
            current.status = OrderStatus::Canceled;
            orders::update_order(tx, &current)?;
            release_reserved_funds(tx, &current)?;
            Ok::<_, Error>(current)
        })
    }

    /// Best crossing order on the opposite side, if any.
    fn next_match(&self, order: &Order) -> Option<Order> {
        let best = self.book(order.side.opposite()).best()?;
        let crosses = match order.side {
            Side::Bid => best.price <= order.price,
            Side::Ask => order.price <= best.price,
        };
        crosses.then(|| best.clone())
    }

    /// Park an unexecutable order in its book if it is within the memory
    /// window; otherwise just note that storage has more.
    fn insert_if_in_range(&mut self, order: Order) {
        let side = order.side;
        let in_range = {
            let book = self.book(side);
            book.len() < MIN_MEMPOOL
                || match book.worst() {
                    Some(worst) => book.better(&order, worst),
                    None => true,
                }
        };
        if !in_range {
            self.set_has_more(side, true);
            return;
        }
        self.book_mut(side).insert(order);
        if self.book(side).len() > MAX_MEMPOOL && self.book_mut(side).pop_worst().is_some() {
            self.set_has_more(side, true);
        }
    }

    /// Refill a drained book window from storage with orders strictly
    /// worse than the current worst resident one. `bound_id` caps the ids
    /// considered, keeping the load consistent with the startup snapshot.
    fn load_more(&mut self, side: Side, bound_id: u64) -> Result<()> {
        if !self.has_more(side) || self.book(side).len() >= MIN_MEMPOOL {
            return Ok(());
        }
        let worst = match self.book(side).worst() {
            Some(worst) => (worst.price, worst.id),
            None => {
                return Err(Error::Invariant(format!(
                    "[{}] has_more set for {} side but its window is empty",
                    self.name,
                    side.as_str()
                )))
            }
        };
        let name = self.name.clone();
        let (more, has_more) = self.store.view(|tx| {
            orders::load_book_orders(tx, &name, side, LOAD_CHUNK, Some(worst), bound_id)
        })?;
        for order in more {
            self.book_mut(side).insert(order);
        }
        self.set_has_more(side, has_more);
        Ok(())
    }

    /// Persist one trade atomically: both orders' fills and statuses, the
    /// trade row, released residual reserves for completed orders, and
    /// the reserve-to-balance settlement.
    fn settle_trade(&self, order: &Order, matched: &Order, trade: Trade) -> Result<()> {
        self.store.serializable(|tx| {
            orders::update_order(tx, matched)?;
            orders::update_order(tx, order)?;

            let mut trade = trade.clone();
            orders::save_trade(tx, &mut trade)?;

            let (bid, ask) = order.sort_bid_ask(matched)?;
            if bid.is_complete() {
                release_reserved_funds(tx, bid)?;
            }
            if ask.is_complete() {
                release_reserved_funds(tx, ask)?;
            }

            settle_balances(tx, &trade)?;
            Ok::<_, Error>(())
        })
    }
}

/// The only place reserves become credited balances.
///
/// Decrements both reserves (failing the transaction if either would go
/// negative) and credits the bid user with the coin and the ask user
/// with the basis, minus the ask fee.
fn settle_balances(tx: &mut Tx, trade: &Trade) -> Result<()> {
    let basis_debit = to_signed(trade.trade_basis + trade.bid_basis_fee)?;
    let amount = to_signed(trade.trade_amount)?;
    ledger::adjust(
        tx,
        trade.bid_user_id,
        WALLET_RESERVED_ORDER,
        &trade.basis_coin,
        -basis_debit,
        true,
    )?;
    ledger::adjust(
        tx,
        trade.ask_user_id,
        WALLET_RESERVED_ORDER,
        &trade.coin,
        -amount,
        true,
    )?;
    ledger::adjust(tx, trade.bid_user_id, WALLET_MAIN, &trade.coin, amount, false)?;
    ledger::adjust(
        tx,
        trade.ask_user_id,
        WALLET_MAIN,
        &trade.basis_coin,
        to_signed(trade.trade_basis - trade.ask_basis_fee)?,
        false,
    )?;
    Ok(())
}

/// Move a new order's funds into the order reserve.
pub(crate) fn reserve_funds(tx: &mut Tx, order: &Order) -> Result<()> {
    match order.side {
        Side::Bid => {
            let reserve = to_signed(order.basis_amount + order.basis_fee)?;
            ledger::adjust(
                tx,
                order.user_id,
                WALLET_MAIN,
                &order.basis_coin,
                -reserve,
                true,
            )?;
            ledger::adjust(
                tx,
                order.user_id,
                WALLET_RESERVED_ORDER,
                &order.basis_coin,
                reserve,
                false,
            )?;
        }
        Side::Ask => {
            let reserve = to_signed(order.amount)?;
            ledger::adjust(tx, order.user_id, WALLET_MAIN, &order.coin, -reserve, true)?;
            ledger::adjust(
                tx,
                order.user_id,
                WALLET_RESERVED_ORDER,
                &order.coin,
                reserve,
                false,
            )?;
        }
    }
    Ok(())
}

/// Return the unfilled remainder of a terminal order's reservation.
fn release_reserved_funds(tx: &mut Tx, order: &Order) -> Result<()> {
    if order.status != OrderStatus::Complete && order.status != OrderStatus::Canceled {
        return Err(Error::Invariant(format!(
            "cannot release reserves of order {} in {:?}",
            order.id, order.status
        )));
    }
    match order.side {
        Side::Bid => {
            let release = to_signed(
                (order.basis_amount - order.basis_filled)
                    + (order.basis_fee - order.basis_fee_filled),
            )?;
            if release > 0 {
                ledger::adjust(
                    tx,
                    order.user_id,
                    WALLET_RESERVED_ORDER,
                    &order.basis_coin,
                    -release,
                    true,
                )?;
                ledger::adjust(
                    tx,
                    order.user_id,
                    WALLET_MAIN,
                    &order.basis_coin,
                    release,
                    false,
                )?;
            }
        }
        Side::Ask => {
            let release = to_signed(order.amount - order.filled)?;
            if release > 0 {
                ledger::adjust(
                    tx,
                    order.user_id,
                    WALLET_RESERVED_ORDER,
                    &order.coin,
                    -release,
                    true,
                )?;
                ledger::adjust(tx, order.user_id, WALLET_MAIN, &order.coin, release, false)?;
            }
        }
    }
    Ok(())
}

fn to_signed(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| Error::Invariant("amount overflows".to_string()))
}
