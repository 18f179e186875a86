//! Order and trade persistence.
//!
//! Pending orders of a market live in the book index (ordered best-first
//! per side); orders that reached a terminal status move to the terminal
//! index, whose maximum id is the startup replay bound.

use ferrox_storage::Tx;

use crate::model::{Order, OrderStatus, Side};
use crate::{keys, Error, Result};

pub fn load_order(tx: &mut Tx, id: u64) -> Result<Order> {
    tx.get_opt(keys::order(id))?.ok_or(Error::OrderNotFound(id))
}

/// Persist a new order, assigning its id. Pending orders enter the book
/// index immediately.
pub fn save_order(tx: &mut Tx, order: &mut Order) -> Result<()> {
    if order.id != 0 {
        return Err(Error::Invariant(format!(
            "order {} has already been saved",
            order.id
        )));
    }
    order.id = tx.next_id("order")?;
    if order.time == 0 {
        order.time = ferrox_util::now();
        order.updated = order.time;
    }
    write_order(tx, order, None)
}

/// Persist fills and status of an existing order, keeping indexes in
/// step with the status.
pub fn update_order(tx: &mut Tx, order: &Order) -> Result<()> {
    let previous = load_order(tx, order.id)?;
    let mut order = order.clone();
    order.updated = ferrox_util::now();
    write_order(tx, &order, Some(&previous))
}

fn write_order(tx: &mut Tx, order: &Order, previous: Option<&Order>) -> Result<()> {
    let market = order.market_name();
    tx.put(keys::order(order.id), order)?;
    match order.status {
        OrderStatus::Pending => {
            tx.put(
                keys::book_entry(&market, order.side, order.price, order.id),
                &order.id,
            )?;
        }
        OrderStatus::Complete | OrderStatus::Canceled => {
            if previous.map_or(false, |p| p.status == OrderStatus::Pending) {
                tx.delete(keys::book_entry(&market, order.side, order.price, order.id));
            }
            tx.put(keys::terminal_entry(&market, order.id), &order.id)?;
        }
    }
    Ok(())
}

/// Highest order id in a terminal status for the market, or 0. Pending
/// orders placed after this id may not have gone through the processor
/// and are replayed on startup.
pub fn last_terminal_order_id(tx: &mut Tx, market: &str) -> Result<u64> {
    let rows: Vec<(Vec<u8>, u64)> =
        tx.scan_prefix(keys::terminal_prefix(market), true, Some(1))?;
    Ok(rows.into_iter().next().map(|(_, id)| id).unwrap_or(0))
}

/// Load up to `limit` pending orders of one side, best-first, strictly
/// worse than `worse_than` (a `(price, id)` book position) and with
/// `id <= max_id`. The second return value reports whether more such
/// orders remain in storage.
pub fn load_book_orders(
    tx: &mut Tx,
    market: &str,
    side: Side,
    limit: usize,
    worse_than: Option<(f64, u64)>,
    max_id: u64,
) -> Result<(Vec<Order>, bool)> {
    let lo = match worse_than {
        Some((price, id)) => {
            // Successor of the exact book key: strictly-worse entries.
            let mut key = keys::book_entry(market, side, price, id);
            key.push(0);
            key
        }
        None => keys::book_prefix(market, side),
    };
    let hi = ferrox_storage::prefix_end(&keys::book_prefix(market, side));
    let ids: Vec<(Vec<u8>, u64)> = tx.scan_range(lo, hi.as_deref(), false, None)?;

    let mut orders = Vec::with_capacity(limit.min(64));
    let mut has_more = false;
    for (_, id) in ids {
        if id > max_id {
            continue;
        }
        if orders.len() == limit {
            has_more = true;
            break;
        }
        orders.push(load_order(tx, id)?);
    }
    Ok((orders, has_more))
}

/// Pending orders of the market with `id >= start_id`, id order. Used by
/// the startup replay; deliberately unpaginated so the replay cannot
/// miss interleaved ids.
pub fn load_pending_since(tx: &mut Tx, market: &str, start_id: u64) -> Result<Vec<Order>> {
    let lo = keys::order(start_id);
    let hi = ferrox_storage::prefix_end(&keys::order_prefix());
    let rows: Vec<(Vec<u8>, Order)> = tx.scan_range(lo, hi.as_deref(), false, None)?;
    Ok(rows
        .into_iter()
        .map(|(_, order)| order)
        .filter(|order| order.status == OrderStatus::Pending && order.market_name() == market)
        .collect())
}

pub fn save_trade(tx: &mut Tx, trade: &mut crate::model::Trade) -> Result<()> {
    trade.id = tx.next_id("trade")?;
    tx.put(keys::trade(trade.id), trade)?;
    Ok(())
}
