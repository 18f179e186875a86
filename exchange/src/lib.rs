//! # Exchange
//!
//! The matching engine: one [`Market`] per configured `(coin, basis)`
//! pair, each owning two bounded in-memory order books, fed by a single
//! order channel with a single consumer. Placing an order validates it,
//! reserves the funds and persists it in one serializable transaction;
//! the processor then matches it under price/time priority, settling
//! every trade atomically against the ledger.

use std::collections::HashMap;
use std::sync::Arc;

use ferrox_config::Config;
use ferrox_storage::Store;
use ferrox_util::math::{round_f64_unsigned, to_sig_figs};
use tokio::sync::mpsc;

mod book;
mod error;
mod keys;
mod market;
mod model;
mod orders;
mod price_log;

#[cfg(test)]
mod tests;

pub use book::Book;
pub use error::Error;
pub use market::Market;
pub use model::{Order, OrderStatus, PriceLog, Side, Trade};
pub use price_log::{PriceLogger, BASIS_INTERVAL, INTERVALS, LONG_INTERVAL};

pub type Result<T> = std::result::Result<T, Error>;

/// Book window bounds: a side is refilled from storage when it drains
/// below the low-water mark and pruned when it grows past the high one.
pub const MIN_MEMPOOL: usize = 800;
pub const MAX_MEMPOOL: usize = 1200;

/// A request to place an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub market: String,
    pub side: Side,
    pub user_id: u64,
    /// Coin limit; may be 0 for bids (derived from `basis_amount`).
    pub amount: u64,
    /// Basis limit; may be 0 for asks (derived from `amount`).
    pub basis_amount: u64,
    pub price: f64,
    /// Fee charged on the basis leg of each fill.
    pub fee_ratio: f64,
}

/// Work items for the order processor.
pub enum OrderCommand {
    Place(Order),
    Cancel { market: String, order_id: u64 },
}

/// Handle for placing and canceling orders; cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    store: Store,
    config: Arc<Config>,
    sender: mpsc::UnboundedSender<OrderCommand>,
}

/// The single consumer owning every market's in-memory state.
pub struct Dispatcher {
    markets: HashMap<String, Market>,
    receiver: mpsc::UnboundedReceiver<OrderCommand>,
}

impl Exchange {
    /// Open all configured markets (replaying orders from the last
    /// shutdown) and return the handle plus the dispatcher to run.
    pub fn start(store: Store, config: Arc<Config>) -> Result<(Exchange, Dispatcher)> {
        let mut markets = HashMap::new();
        for spec in &config.markets {
            let market = Market::open(store.clone(), &spec.basis_coin, &spec.coin)?;
            markets.insert(spec.name(), market);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        Ok((
            Exchange {
                store,
                config,
                sender,
            },
            Dispatcher { markets, receiver },
        ))
    }

    /// Validate, reserve funds, persist and enqueue a new order. The
    /// reservation and the order row commit in one serializable
    /// transaction; with insufficient funds nothing is written.
    pub fn add_order(&self, new_order: NewOrder) -> Result<Order> {
        let template = self.validate(new_order)?;
        let order = self.store.serializable(|tx| {
            let mut order = template.clone();
            orders::save_order(tx, &mut order)?;
            market::reserve_funds(tx, &order)?;
            Ok::<_, Error>(order)
        })?;
        self.sender
            .send(OrderCommand::Place(order.clone()))
            .map_err(|_| Error::EngineStopped)?;
        Ok(order)
    }

    /// Enqueue a cancellation for the market's processor.
    pub fn cancel_order(&self, market: &str, order_id: u64) -> Result<()> {
        if !self.config.markets.iter().any(|spec| spec.name() == market) {
            return Err(Error::UnknownMarket(market.to_string()));
        }
        self.sender
            .send(OrderCommand::Cancel {
                market: market.to_string(),
                order_id,
            })
            .map_err(|_| Error::EngineStopped)
    }

    fn validate(&self, new_order: NewOrder) -> Result<Order> {
        let spec = self
            .config
            .markets
            .iter()
            .find(|spec| spec.name() == new_order.market)
            .ok_or_else(|| Error::UnknownMarket(new_order.market.clone()))?;
        let coin = self.config.coin(&spec.coin)?;
        let basis = self.config.coin(&spec.basis_coin)?;

        let mut amount = new_order.amount;
        let mut basis_amount = new_order.basis_amount;
        if amount == 0 && basis_amount == 0 {
            return Err(Error::InvalidOrder("an order amount is required"));
        }
        if !new_order.price.is_finite() || new_order.price <= 0.0 {
            return Err(Error::InvalidOrder("a positive order price is required"));
        }
        if !new_order.fee_ratio.is_finite() || !(0.0..1.0).contains(&new_order.fee_ratio) {
            return Err(Error::InvalidOrder("fee ratio must be in [0, 1)"));
        }
        // Quote prices at 5 significant figures.
        let price = to_sig_figs(new_order.price, 5);

        if amount > 0 && amount < coin.min_trade {
            return Err(Error::BelowMinTrade {
                coin: coin.name.clone(),
                min: coin.min_trade,
            });
        }
        if basis_amount > 0 && basis_amount < basis.min_trade {
            return Err(Error::BelowMinTrade {
                coin: basis.name.clone(),
                min: basis.min_trade,
            });
        }

        // Derive the missing limit from the limit price.
        match new_order.side {
            Side::Ask if amount == 0 => {
                amount = round_f64_unsigned(basis_amount as f64 / price);
            }
            Side::Bid if basis_amount == 0 => {
                basis_amount = round_f64_unsigned(amount as f64 * price);
            }
            _ => {}
        }

        let basis_estimate = if basis_amount > 0 {
            basis_amount
        } else {
            round_f64_unsigned(amount as f64 * price)
        };
        let basis_fee = round_f64_unsigned(new_order.fee_ratio * basis_estimate as f64);

        let now = ferrox_util::now();
        let order = Order {
            id: 0,
            side: new_order.side,
            user_id: new_order.user_id,
            coin: spec.coin.clone(),
            amount,
            filled: 0,
            basis_coin: spec.basis_coin.clone(),
            basis_amount,
            basis_filled: 0,
            basis_fee,
            basis_fee_filled: 0,
            basis_fee_ratio: new_order.fee_ratio,
            price,
            status: OrderStatus::Pending,
            time: now,
            updated: now,
        };
        order.validate()?;
        Ok(order)
    }
}

impl Dispatcher {
    /// Drain the order channel forever.
    pub async fn run(mut self) {
        log::info!("order processor started ({} markets)", self.markets.len());
        while let Some(command) = self.receiver.recv().await {
            if let Err(e) = self.dispatch(command) {
                // Operator-grade problem: the order stays pending and is
                // replayed on the next startup.
                log::error!("order processing failed: {e}");
            }
        }
    }

    /// Process one command synchronously.
    pub fn dispatch(&mut self, command: OrderCommand) -> Result<()> {
        match command {
            OrderCommand::Place(order) => {
                let name = order.market_name();
                let market = self
                    .markets
                    .get_mut(&name)
                    .ok_or(Error::UnknownMarket(name))?;
                market.process_order(order)?;
            }
            OrderCommand::Cancel { market, order_id } => {
                let market = self
                    .markets
                    .get_mut(&market)
                    .ok_or(Error::UnknownMarket(market))?;
                market.cancel_order(order_id)?;
            }
        }
        Ok(())
    }

    /// Process everything currently queued; returns how many commands
    /// ran. Lets synchronous callers (and tests) drive the engine.
    pub fn run_pending(&mut self) -> Result<usize> {
        let mut processed = 0;
        while let Ok(command) = self.receiver.try_recv() {
            self.dispatch(command)?;
            processed += 1;
        }
        Ok(processed)
    }

    pub fn market(&self, name: &str) -> Option<&Market> {
        self.markets.get(name)
    }
}
