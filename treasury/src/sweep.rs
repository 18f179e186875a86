//! Sweeping: consolidate hot-wallet UTXOs into fresh addresses under a
//! (typically offline) master key.
//!
//! Everything here is deterministic for a given storage state, which is
//! what makes dry runs meaningful: a dry run derives throwaway addresses
//! on a separate chain path but selects the exact inputs and amounts the
//! real run would.

use std::collections::BTreeMap;

use ferrox_chain::model::{Mpk, Payment};
use ferrox_chain::{payments, registry, CHAINPATH_PREFIX_SWEEP, CHAINPATH_PREFIX_SWEEP_DRY};
use ferrox_ledger::{SYSTEM_USER, WALLET_SWEEP, WALLET_SWEEP_DRY};

use crate::{BuiltTransaction, Error, OutboundKind, OutboundTx, Result, Treasury};

/// Partition `total` into at most `max_outputs` amounts within
/// `[min_output, max_output]`, spread linearly and symmetrically around
/// the mean. Returns `None` when no output count in range can hold
/// `total` inside the band. The one exception: a `total` below
/// `min_output` comes back as a single undersized output rather than
/// failing the sweep.
///
/// The spread depends only on its arguments, never on wall time.
pub fn compute_sweep_outputs(
    total: u64,
    min_output: u64,
    max_output: u64,
    max_outputs: usize,
) -> Option<Vec<u64>> {
    if total == 0 || max_outputs == 0 || min_output > max_output {
        return None;
    }
    match max_output.checked_mul(max_outputs as u64) {
        Some(capacity) if capacity < total => return None,
        _ => {}
    }
    if total < min_output {
        // Not enough for even one in-range output; run with it anyway.
        return Some(vec![total]);
    }

    // A count only works when `count*min <= total <= count*max`, which
    // pins the mean itself inside the band. Prefer the count that
    // centers the outputs on the middle of the band, clamped into that
    // window; an empty window means the band cannot hold `total`.
    let lowest =
        (((total as u128 + max_output as u128 - 1) / max_output as u128) as usize).max(1);
    let highest = if min_output == 0 {
        max_outputs
    } else {
        (total / min_output).min(max_outputs as u64) as usize
    };
    if lowest > highest {
        return None;
    }
    let mid = (min_output + max_output) / 2;
    let preferred = (total as f64 / mid as f64 + 0.5) as usize;
    let count = preferred.clamp(lowest, highest);

    let avg = total as f64 / count as f64;
    let max_deviation = if avg > mid as f64 {
        max_output as f64 - avg
    } else {
        avg - min_output as f64
    };

    // count=5 pairs deviations ±4/4, ±2/4 around the mean plus the mean
    // itself; even counts drop the center element. Rounding can drift a
    // slot one unit past the band, so every slot is clamped back in.
    let clamped = |value: f64| (value as u64).clamp(min_output, max_output);
    let mut amounts = Vec::with_capacity(count);
    for i in 0..count / 2 {
        let deviation =
            ((count - 1) - i * 2) as f64 / (count - 1) as f64 * max_deviation;
        amounts.push(clamped(avg + deviation + 0.5));
        amounts.push(clamped(avg - deviation + 0.5));
    }
    if count % 2 == 1 {
        amounts.push(clamped(avg + 0.5));
    }

    // Rounding residue: grow the smallest slots or shrink the largest
    // ones, by value, never past the band. The count window guarantees
    // the residue fits the remaining headroom.
    let sum: u64 = amounts.iter().sum();
    if total > sum {
        let mut residue = total - sum;
        let mut order: Vec<usize> = (0..amounts.len()).collect();
        order.sort_by_key(|&i| amounts[i]);
        for i in order {
            let add = (max_output - amounts[i]).min(residue);
            amounts[i] += add;
            residue -= add;
            if residue == 0 {
                break;
            }
        }
    } else if sum > total {
        let mut residue = sum - total;
        let mut order: Vec<usize> = (0..amounts.len()).collect();
        order.sort_by_key(|&i| std::cmp::Reverse(amounts[i]));
        for i in order {
            let take = (amounts[i] - min_output).min(residue);
            amounts[i] -= take;
            residue -= take;
            if residue == 0 {
                break;
            }
        }
    }
    Some(amounts)
}

impl Treasury {
    /// Gather up to `max_inputs` of the oldest spendable hot payments
    /// with amounts in `[min_input, max_input]`, stopping at `max_total`.
    pub async fn collect_sweep_inputs(
        &self,
        in_mpk: &Mpk,
        min_input: u64,
        max_input: u64,
        max_total: u64,
        max_inputs: usize,
    ) -> Result<(Vec<Payment>, u64)> {
        if min_input < self.coin().miner_fee {
            return Err(Error::MinInputBelowFee(self.coin().miner_fee));
        }
        let req_height = self.req_height().await?;
        let candidates = self.store().view(|tx| {
            payments::oldest_spendable_between(
                tx,
                in_mpk.id,
                &self.coin().name,
                min_input,
                max_input,
                max_inputs,
                req_height,
            )
        })?;

        let mut inputs = Vec::new();
        let mut total: u64 = 0;
        for payment in candidates {
            if total + payment.amount > max_total {
                continue;
            }
            total += payment.amount;
            inputs.push(payment);
        }

        // A sweep below the worst-case fee is not worth broadcasting.
        if total < self.max_miner_fee() {
            return Err(Error::SweepTooSmall {
                needed: self.max_miner_fee(),
                got: total,
            });
        }
        Ok((inputs, total))
    }

    /// Build a signed sweep of `inputs` into fresh addresses derived for
    /// `out_mpk`. With `dry` set the addresses come from the throwaway
    /// chain path and the result must not be broadcast.
    pub async fn compute_sweep_transaction(
        &self,
        inputs: &[Payment],
        out_mpk: &Mpk,
        min_output: u64,
        max_output: u64,
        max_outputs: usize,
        dry: bool,
    ) -> Result<BuiltTransaction> {
        for payment in inputs {
            if payment.coin != self.coin().name {
                return Err(Error::Invariant(format!(
                    "sweep input {} is for coin {}",
                    payment.id, payment.coin
                )));
            }
        }
        let total: u64 = inputs.iter().map(|p| p.amount).sum();

        let mut amounts = compute_sweep_outputs(total, min_output, max_output, max_outputs)
            .ok_or(Error::SweepUnsatisfiable { total })?;
        // Reserve the worst-case fee up front; the adjustment below
        // returns whatever the real size does not need.
        amounts[0] = amounts[0]
            .checked_sub(self.max_miner_fee())
            .ok_or(Error::SweepTooSmall {
                needed: self.max_miner_fee(),
                got: amounts[0],
            })?;

        let mut outputs = BTreeMap::new();
        let mut change_address: Option<String> = None;
        for amount in amounts {
            let address = self.create_sweep_address(out_mpk, dry)?;
            if change_address.is_none() {
                change_address = Some(address.clone());
            }
            outputs.insert(address, amount);
        }
        let change_address = change_address.ok_or_else(|| {
            Error::Invariant("sweep produced no outputs".to_string())
        })?;

        let miner_fee = self
            .adjust_miner_fee(inputs, &mut outputs, &change_address)
            .await?;
        let signed_hex = self.sign_transaction(inputs, &outputs).await?;
        Ok(BuiltTransaction {
            signed_hex,
            inputs: inputs.to_vec(),
            miner_fee,
            change_address,
            outputs,
        })
    }

    /// Persist and broadcast a computed (non-dry) sweep.
    pub async fn broadcast_sweep(
        &self,
        built: &BuiltTransaction,
        out_mpk: &Mpk,
    ) -> Result<OutboundTx> {
        let total: u64 = built.outputs.values().sum();
        let wtx = self.save_outbound_tx(OutboundKind::Sweep, Some(out_mpk.id), total, built)?;
        self.finish_outbound(built, &wtx).await?;
        log::info!(
            "[{}] broadcast sweep tx {} ({} outputs, fee {})",
            self.coin().name,
            wtx.tx_id,
            built.outputs.len(),
            built.miner_fee
        );
        Ok(wtx)
    }

    fn create_sweep_address(&self, out_mpk: &Mpk, dry: bool) -> Result<String> {
        let (chain_path, wallet) = if dry {
            (CHAINPATH_PREFIX_SWEEP_DRY.to_string(), WALLET_SWEEP_DRY)
        } else {
            (CHAINPATH_PREFIX_SWEEP.to_string(), WALLET_SWEEP)
        };
        let address = registry::create_new_address(
            self.store(),
            self.engine(),
            self.coin(),
            SYSTEM_USER,
            wallet,
            out_mpk,
            &chain_path,
        )?;
        Ok(address.address)
    }
}

#[cfg(test)]
mod tests {
    use super::compute_sweep_outputs;

    fn check(total: u64, min_output: u64, max_output: u64, max_outputs: usize) {
        let amounts = compute_sweep_outputs(total, min_output, max_output, max_outputs)
            .expect("constraints should be satisfiable");
        assert!(
            amounts.len() <= max_outputs,
            "{} outputs exceed max {max_outputs}",
            amounts.len()
        );
        for amount in &amounts {
            assert!(*amount >= min_output, "output {amount} below {min_output}");
            assert!(*amount <= max_output, "output {amount} above {max_output}");
        }
        assert_eq!(amounts.iter().sum::<u64>(), total);
    }

    #[test]
    fn spreads_satisfy_their_constraints() {
        check(1_000, 10, 50, 100);
        check(1_000, 10, 10, 100);
        check(1_000, 10, 11, 100);
        check(5_000, 10, 50, 100);
    }

    #[test]
    fn tight_bands_stay_inside_the_band() {
        // The mean lands just above the band middle; the raw symmetric
        // spread would round one slot below the minimum.
        check(101, 10, 11, 10);
        check(23, 10, 12, 3);
        check(119, 10, 12, 12);
    }

    #[test]
    fn totals_no_count_can_hold_are_rejected() {
        // Two outputs top out at 22, three start at 30: 23 fits neither.
        assert_eq!(compute_sweep_outputs(23, 10, 11, 3), None);
        assert_eq!(compute_sweep_outputs(0, 10, 11, 3), None);
        assert_eq!(compute_sweep_outputs(100, 11, 10, 3), None);
    }

    #[test]
    fn spread_is_deterministic() {
        let a = compute_sweep_outputs(123_456, 100, 5_000, 64).unwrap();
        let b = compute_sweep_outputs(123_456, 100, 5_000, 64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn undersized_total_collapses_to_one_output() {
        assert_eq!(compute_sweep_outputs(7, 10, 50, 4), Some(vec![7]));
    }

    #[test]
    fn impossible_constraints_are_rejected() {
        assert_eq!(compute_sweep_outputs(1_000, 10, 50, 4), None);
    }
}
