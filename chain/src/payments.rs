//! Payment (UTXO) store.
//!
//! The per-coin synchronizer is the only writer of payment rows for its
//! coin, except for the spent state machine which the treasury drives
//! through guarded transitions.

use ferrox_storage::{prefix_end, Tx};

use crate::model::{OrphanStatus, Payment, SpentStatus};
use crate::rpc::RpcPayment;
use crate::{keys, Error, Result};

fn spendable_key(payment: &Payment) -> Option<Vec<u8>> {
    let indexed = payment.spent == SpentStatus::Available
        && payment.orphaned == OrphanStatus::Good
        && payment.blockheight.is_some();
    indexed.then(|| {
        keys::payment_spendable(payment.mpk_id, &payment.coin, payment.amount, payment.id)
    })
}

/// Write a payment row and keep its indexes in step. `previous` is the row
/// as it was loaded inside this same transaction, or `None` on insert.
fn write_payment(tx: &mut Tx, payment: &Payment, previous: Option<&Payment>) -> Result<()> {
    if let Some(previous) = previous {
        if let Some(key) = spendable_key(previous) {
            tx.delete(key);
        }
        if let Some(blockhash) = &previous.blockhash {
            tx.delete(keys::payment_by_block(blockhash, previous.id));
        }
    }
    tx.put(keys::payment(payment.id), payment)?;
    tx.put(
        keys::payment_by_outpoint(&payment.tx_id, payment.vout),
        &payment.id,
    )?;
    if let Some(key) = spendable_key(payment) {
        tx.put(key, &payment.id)?;
    }
    if let Some(blockhash) = &payment.blockhash {
        tx.put(keys::payment_by_block(blockhash, payment.id), &payment.id)?;
    }
    Ok(())
}

pub fn load_payment(tx: &mut Tx, id: u64) -> Result<Payment> {
    tx.get_opt(keys::payment(id))?.ok_or(Error::NotFound {
        entity: "payment",
        key: id.to_string(),
    })
}

pub fn load_payment_by_outpoint(tx: &mut Tx, tx_id: &str, vout: u32) -> Result<Option<Payment>> {
    let id: Option<u64> = tx.get_opt(keys::payment_by_outpoint(tx_id, vout))?;
    match id {
        Some(id) => Ok(Some(load_payment(tx, id)?)),
        None => Ok(None),
    }
}

/// Payments confirmed by a block, regardless of spent/orphan status.
pub fn payments_by_blockhash(tx: &mut Tx, blockhash: &str) -> Result<Vec<Payment>> {
    let ids: Vec<(Vec<u8>, u64)> =
        tx.scan_prefix(keys::payment_by_block_prefix(blockhash), false, None)?;
    ids.into_iter()
        .map(|(_, id)| load_payment(tx, id))
        .collect()
}

/// Insert a recognized payment, or refresh an existing `(tx_id, vout)`
/// row: the block reference and timestamps are updated and the payment is
/// un-orphaned. This is how a payment moves back to the main chain after
/// a reorg resolves.
pub fn upsert_payment(tx: &mut Tx, rpc: &RpcPayment, mpk_id: u64) -> Result<Payment> {
    match load_payment_by_outpoint(tx, &rpc.tx_id, rpc.vout)? {
        Some(mut payment) => {
            let previous = payment.clone();
            payment.blockhash = rpc.blockhash.clone();
            payment.blockheight = rpc.blockheight;
            payment.orphaned = OrphanStatus::Good;
            payment.time = rpc.time;
            payment.updated = ferrox_util::now();
            write_payment(tx, &payment, Some(&previous))?;
            Ok(payment)
        }
        None => {
            let id = tx.next_id("payment")?;
            let mut payment = Payment::from_rpc(rpc, mpk_id);
            payment.id = id;
            write_payment(tx, &payment, None)?;
            Ok(payment)
        }
    }
}

/// Flip a payment's orphan flag.
pub fn set_payment_orphaned(tx: &mut Tx, id: u64, orphaned: OrphanStatus) -> Result<Payment> {
    let previous = load_payment(tx, id)?;
    let mut payment = previous.clone();
    payment.orphaned = orphaned;
    payment.updated = ferrox_util::now();
    write_payment(tx, &payment, Some(&previous))?;
    Ok(payment)
}

/// Transition a set of payments `old -> new` in the spent state machine,
/// asserting every row currently is in `old`. A mismatch aborts the
/// transaction.
pub fn update_payments_spent(
    tx: &mut Tx,
    ids: &[u64],
    old: SpentStatus,
    new: SpentStatus,
    wtx_id: Option<u64>,
) -> Result<()> {
    for &id in ids {
        let previous = load_payment(tx, id)?;
        if previous.spent != old {
            return Err(Error::UnexpectedSpentStatus {
                id,
                expected: old,
                actual: previous.spent,
            });
        }
        let mut payment = previous.clone();
        payment.spent = new;
        if wtx_id.is_some() {
            payment.wtx_id = wtx_id;
        }
        payment.updated = ferrox_util::now();
        write_payment(tx, &payment, Some(&previous))?;
    }
    Ok(())
}

/// Smallest spendable payment with `amount >= target`, skipping `exclude`.
pub fn smallest_spendable_at_least(
    tx: &mut Tx,
    mpk_id: u64,
    coin: &str,
    target: u64,
    req_height: u32,
    exclude: &[u64],
) -> Result<Option<Payment>> {
    let lo = keys::payment_spendable_amount(mpk_id, coin, target);
    let hi = prefix_end(&keys::payment_spendable_prefix(mpk_id, coin));
    let ids: Vec<(Vec<u8>, u64)> = tx.scan_range(lo, hi.as_deref(), false, None)?;
    first_spendable(tx, ids, req_height, exclude)
}

/// Largest spendable payment with `amount <= target`, skipping `exclude`.
pub fn largest_spendable_at_most(
    tx: &mut Tx,
    mpk_id: u64,
    coin: &str,
    target: u64,
    req_height: u32,
    exclude: &[u64],
) -> Result<Option<Payment>> {
    let lo = keys::payment_spendable_prefix(mpk_id, coin);
    let hi = keys::payment_spendable_amount(mpk_id, coin, target.saturating_add(1));
    let ids: Vec<(Vec<u8>, u64)> = tx.scan_range(lo, Some(&hi), true, None)?;
    first_spendable(tx, ids, req_height, exclude)
}

fn first_spendable(
    tx: &mut Tx,
    ids: Vec<(Vec<u8>, u64)>,
    req_height: u32,
    exclude: &[u64],
) -> Result<Option<Payment>> {
    for (_, id) in ids {
        if exclude.contains(&id) {
            continue;
        }
        let payment = load_payment(tx, id)?;
        if payment.spendable_at(req_height) {
            return Ok(Some(payment));
        }
    }
    Ok(None)
}

/// Oldest spendable payments with amounts in `[min, max]`, at most
/// `limit`. Sweeps use this so that input selection stays deterministic.
pub fn oldest_spendable_between(
    tx: &mut Tx,
    mpk_id: u64,
    coin: &str,
    min: u64,
    max: u64,
    limit: usize,
    req_height: u32,
) -> Result<Vec<Payment>> {
    let lo = keys::payment_spendable_amount(mpk_id, coin, min);
    let hi = keys::payment_spendable_amount(mpk_id, coin, max.saturating_add(1));
    let ids: Vec<(Vec<u8>, u64)> = tx.scan_range(lo, Some(&hi), false, None)?;
    let mut payments = Vec::new();
    for (_, id) in ids {
        let payment = load_payment(tx, id)?;
        if payment.spendable_at(req_height) {
            payments.push(payment);
        }
    }
    payments.sort_by_key(|p| p.id);
    payments.truncate(limit);
    Ok(payments)
}
