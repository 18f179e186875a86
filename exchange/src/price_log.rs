//! Per-market OHLC aggregation.
//!
//! Trades accumulate into an open basis-interval bucket; when a trade
//! arrives for a later interval the bucket is persisted and every parent
//! interval containing it is recomputed and upserted. The open bucket is
//! memory-only, so a restart loses at most one basis interval of data.

use ferrox_storage::{Store, Tx};

use crate::model::{PriceLog, Side};
use crate::{keys, Error, Result};

/// Bucket widths, smallest (the basis interval) first.
pub const INTERVALS: [i64; 3] = [60, 300, 3600];
pub const BASIS_INTERVAL: i64 = INTERVALS[0];
pub const LONG_INTERVAL: i64 = INTERVALS[INTERVALS.len() - 1];

pub struct PriceLogger {
    store: Store,
    market: String,
    /// Recent basis buckets, time ascending, bounded to one long interval.
    entries: Vec<PriceLog>,
    current: Option<PriceLog>,
}

impl PriceLogger {
    pub fn open(store: Store, market: &str) -> Result<Self> {
        let window = (LONG_INTERVAL / BASIS_INTERVAL) as usize;
        let mut entries: Vec<PriceLog> = store.view(|tx| {
            let rows: Vec<(Vec<u8>, PriceLog)> = tx.scan_prefix(
                keys::price_log_interval_prefix(market, BASIS_INTERVAL),
                true,
                Some(window),
            )?;
            Ok::<_, Error>(rows.into_iter().map(|(_, plog)| plog).collect())
        })?;
        entries.reverse();
        Ok(PriceLogger {
            store,
            market: market.to_string(),
            entries,
            current: None,
        })
    }

    /// Record a trade datapoint at time `t`.
    pub fn add_trade(&mut self, side: Side, amount: u64, price: f64, t: i64) -> Result<()> {
        let t = t / BASIS_INTERVAL * BASIS_INTERVAL;
        let (bid_volume, ask_volume) = match side {
            Side::Bid => (amount, 0),
            Side::Ask => (0, amount),
        };

        if self.current.as_ref().is_some_and(|current| current.time < t) {
            let finished = self.current.take().expect("just observed");
            self.persist_basis_bucket(finished)?;
        }
        let current = self.current.get_or_insert_with(|| PriceLog {
            id: 0,
            market: self.market.clone(),
            low: price,
            high: price,
            open: price,
            close: price,
            interval: BASIS_INTERVAL,
            ask_volume: 0,
            bid_volume: 0,
            time: t,
        });
        if price < current.low {
            current.low = price;
        }
        if current.high < price {
            current.high = price;
        }
        current.ask_volume += ask_volume;
        current.bid_volume += bid_volume;
        current.close = price;
        Ok(())
    }

    /// Close price of the most recent datapoint, 0 when none.
    pub fn last_price(&self) -> f64 {
        if let Some(current) = &self.current {
            return current.close;
        }
        self.entries.last().map(|plog| plog.close).unwrap_or(0.0)
    }

    /// Persisted buckets of one interval with `start <= time < end`.
    pub fn load_prices(&self, interval: i64, start: i64, end: i64) -> Result<Vec<PriceLog>> {
        let start = start / interval * interval;
        self.store
            .view(|tx| load_price_logs(tx, &self.market, interval, start, end))
    }

    /// Write a closed basis bucket and recompute its parent intervals.
    fn persist_basis_bucket(&mut self, plog: PriceLog) -> Result<()> {
        if plog.interval != BASIS_INTERVAL {
            return Err(Error::Invariant(
                "only basis buckets can be persisted directly".to_string(),
            ));
        }
        if plog.time % plog.interval != 0 {
            return Err(Error::Invariant("bucket time is not aligned".to_string()));
        }
        self.entries.push(plog.clone());
        let window = (LONG_INTERVAL / BASIS_INTERVAL) as usize;
        if self.entries.len() > window {
            let excess = self.entries.len() - window;
            self.entries.drain(..excess);
        }

        let mut to_save = vec![plog.clone()];
        for &interval in &INTERVALS[1..] {
            if let Some(parent) = self.compute_for_interval(plog.time, interval) {
                to_save.push(parent);
            }
        }
        self.store.serializable(|tx| {
            for plog in &to_save {
                save_or_update_price_log(tx, plog)?;
            }
            Ok::<_, Error>(())
        })
    }

    /// Aggregate the buffered basis buckets falling inside the interval
    /// containing `t`. `None` when no trades landed there.
    fn compute_for_interval(&self, t: i64, interval: i64) -> Option<PriceLog> {
        let start = t / interval * interval;
        let end = start + interval;
        let in_range: Vec<&PriceLog> = self
            .entries
            .iter()
            .filter(|plog| plog.time >= start && plog.time + plog.interval <= end)
            .collect();
        let first = in_range.first()?;
        let last = in_range.last()?;

        let mut parent = PriceLog {
            id: 0,
            market: self.market.clone(),
            low: f64::MAX,
            high: 0.0,
            open: first.open,
            close: last.close,
            interval,
            ask_volume: 0,
            bid_volume: 0,
            time: start,
        };
        for plog in &in_range {
            if plog.low < parent.low {
                parent.low = plog.low;
            }
            if parent.high < plog.high {
                parent.high = plog.high;
            }
            parent.ask_volume += plog.ask_volume;
            parent.bid_volume += plog.bid_volume;
        }
        Some(parent)
    }
}

/// Upsert on `(market, interval, time)`.
fn save_or_update_price_log(tx: &mut Tx, plog: &PriceLog) -> Result<()> {
    let key = keys::price_log(&plog.market, plog.interval, plog.time);
    let mut plog = plog.clone();
    match tx.get_opt::<PriceLog>(&key)? {
        Some(existing) => plog.id = existing.id,
        None => plog.id = tx.next_id("price_log")?,
    }
    tx.put(&key, &plog)?;
    Ok(())
}

pub fn load_price_logs(
    tx: &mut Tx,
    market: &str,
    interval: i64,
    start: i64,
    end: i64,
) -> Result<Vec<PriceLog>> {
    let lo = keys::price_log(market, interval, start);
    let hi = keys::price_log(market, interval, end);
    let rows: Vec<(Vec<u8>, PriceLog)> = tx.scan_range(lo, Some(&hi), false, None)?;
    Ok(rows.into_iter().map(|(_, plog)| plog).collect())
}
