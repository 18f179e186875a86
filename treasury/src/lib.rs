//! # Treasury
//!
//! The per-coin worker that turns checked-out withdrawals into signed,
//! broadcast transactions, plus the sweep machinery that consolidates hot
//! UTXOs under another master key.
//!
//! The whole protocol is restartable: withdrawals move through the
//! guarded pending → checked-out → complete state machine, inputs move
//! through available → checked-out → spent, and any failure before
//! broadcast stalls the withdrawals for an operator to resume. Nothing
//! here holds state the storage layer does not.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ferrox_chain::model::{Mpk, Payment, SpentStatus};
use ferrox_chain::rpc::ChainRpc;
use ferrox_chain::{payments, registry, CHAINPATH_PREFIX_CHANGE};
use ferrox_config::CoinSpec;
use ferrox_crypto::KeyDerivation;
use ferrox_ledger::{self as ledger, Ledger, SYSTEM_USER, WALLET_CHANGE};
use ferrox_protected::Protected;
use ferrox_storage::Store;
use ferrox_util::Alerter;

mod error;
mod hotkeys;
mod model;
mod sweep;

#[cfg(test)]
mod tests;

pub use error::Error;
pub use hotkeys::HotKeyStore;
pub use model::{OutboundKind, OutboundTx};
pub use sweep::compute_sweep_outputs;

pub type Result<T> = std::result::Result<T, Error>;

/// Miner-fee multiples over-reserved before the size-based adjustment.
pub const MAX_BASE_FEES: u64 = 10;
/// Pending withdrawals claimed per tick.
const WITHDRAWAL_BATCH: usize = 8;
const TICK: Duration = Duration::from_secs(30);
const KEY_WAIT: Duration = Duration::from_secs(60);
/// Seconds the chain tip height stays cached.
const TIP_CACHE_SECS: i64 = 10;

/// A constructed and signed transaction that has not been broadcast yet.
pub struct BuiltTransaction {
    pub signed_hex: String,
    pub inputs: Vec<Payment>,
    pub miner_fee: u64,
    pub change_address: String,
    /// Final outputs, including change and the fee refund.
    pub outputs: BTreeMap<String, u64>,
}

impl BuiltTransaction {
    pub fn input_ids(&self) -> Vec<u64> {
        self.inputs.iter().map(|p| p.id).collect()
    }
}

pub struct Treasury {
    coin: CoinSpec,
    store: Store,
    ledger: Ledger,
    rpc: Arc<dyn ChainRpc>,
    engine: Arc<dyn KeyDerivation>,
    hot_keys: Arc<HotKeyStore>,
    hot_mpk: Mpk,
    alerter: Arc<Alerter>,
    /// `(fetched_at, tip_height)`.
    tip_cache: Mutex<(i64, u32)>,
}

impl Treasury {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coin: CoinSpec,
        store: Store,
        ledger: Ledger,
        rpc: Arc<dyn ChainRpc>,
        engine: Arc<dyn KeyDerivation>,
        hot_keys: Arc<HotKeyStore>,
        hot_mpk: Mpk,
        alerter: Arc<Alerter>,
    ) -> Self {
        Treasury {
            coin,
            store,
            ledger,
            rpc,
            engine,
            hot_keys,
            hot_mpk,
            alerter,
            tip_cache: Mutex::new((0, 0)),
        }
    }

    pub fn hot_mpk(&self) -> &Mpk {
        &self.hot_mpk
    }

    /// Worker entry point. Sleeps until the hot key is injected, then
    /// drains pending withdrawals; errors stall the batch and alert.
    pub async fn run(self) {
        log::info!("[{}] treasury worker started", self.coin.name);
        loop {
            if !self.hot_keys.has(&self.hot_mpk.pub_key) {
                log::warn!(
                    "[{}] waiting for the hot master private key ({})",
                    self.coin.name,
                    self.hot_mpk.pub_key
                );
                tokio::time::sleep(KEY_WAIT).await;
                continue;
            }
            match self.process_user_withdrawals().await {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("[{}] no withdrawals to process", self.coin.name);
                    tokio::time::sleep(TICK).await;
                }
                Err(e) => {
                    self.alerter
                        .alert(&format!("[{}] withdrawals stalled: {e}", self.coin.name));
                    tokio::time::sleep(TICK).await;
                }
            }
        }
    }

    /// Claim a batch of pending withdrawals and push them through to
    /// broadcast. Returns `Ok(false)` when there was nothing to do.
    pub async fn process_user_withdrawals(&self) -> Result<bool> {
        let withdrawals = self
            .ledger
            .checkout_withdrawals(&self.coin.name, WITHDRAWAL_BATCH)?;
        if withdrawals.is_empty() {
            return Ok(false);
        }
        let ids: Vec<u64> = withdrawals.iter().map(|w| w.id).collect();

        let mut outputs: BTreeMap<String, u64> = BTreeMap::new();
        let mut amount_sum: u64 = 0;
        for withdrawal in &withdrawals {
            if withdrawal.amount == 0 {
                return Err(Error::Invariant(format!(
                    "withdrawal {} has zero amount",
                    withdrawal.id
                )));
            }
            *outputs.entry(withdrawal.to_address.clone()).or_insert(0) += withdrawal.amount;
            amount_sum += withdrawal.amount;
        }

        let built = match self.compute_withdrawal_transaction(outputs).await {
            Ok(built) => built,
            Err(e) => {
                // Return the batch to the operator queue; re-running after
                // a stall is the designed recovery path.
                self.ledger.stall_withdrawals(&ids)?;
                return Err(e);
            }
        };

        let wtx = self.save_outbound_tx(
            OutboundKind::Withdrawal,
            None,
            amount_sum,
            &built,
        )?;

        // The change output creates a debt on the system change wallet
        // that returns to zero once the change confirms on-chain.
        if let Some(&change) = built.outputs.get(&built.change_address) {
            self.store.serializable(|tx| {
                let change = i64::try_from(change).map_err(|_| ledger::Error::AmountOverflow)?;
                ledger::adjust(
                    tx,
                    SYSTEM_USER,
                    WALLET_CHANGE,
                    &self.coin.name,
                    -change,
                    false,
                )?;
                Ok::<_, ledger::Error>(())
            })?;
        }

        self.finish_outbound(&built, &wtx).await?;
        self.ledger.complete_withdrawals(&withdrawals, wtx.id)?;
        log::info!(
            "[{}] broadcast withdrawal tx {} for {} withdrawals ({} base units, fee {})",
            self.coin.name,
            wtx.tx_id,
            withdrawals.len(),
            amount_sum,
            built.miner_fee
        );
        Ok(true)
    }

    /// Check out the inputs, broadcast, and mark the inputs spent.
    /// Shared by withdrawals and sweeps.
    pub(crate) async fn finish_outbound(
        &self,
        built: &BuiltTransaction,
        wtx: &OutboundTx,
    ) -> Result<()> {
        let input_ids = built.input_ids();
        self.store.serializable(|tx| {
            payments::update_payments_spent(
                tx,
                &input_ids,
                SpentStatus::Available,
                SpentStatus::CheckedOut,
                Some(wtx.id),
            )
        })?;

        self.rpc
            .send_raw_transaction(&self.coin.name, &built.signed_hex)
            .await?;

        self.store.serializable(|tx| {
            payments::update_payments_spent(
                tx,
                &input_ids,
                SpentStatus::CheckedOut,
                SpentStatus::Spent,
                Some(wtx.id),
            )
        })?;
        Ok(())
    }

    /// Select inputs and build a signed transaction satisfying `outputs`.
    ///
    /// Side-effect free apart from deriving the change address, so a
    /// failed attempt can simply be retried later. The returned outputs
    /// include the change output and the fee refund.
    pub async fn compute_withdrawal_transaction(
        &self,
        mut outputs: BTreeMap<String, u64>,
    ) -> Result<BuiltTransaction> {
        let req_height = self.req_height().await?;
        let change_address = self.create_change_address()?;

        let target: u64 = outputs.values().sum::<u64>() + self.max_miner_fee();
        // Prefer one input that covers the whole remainder; otherwise eat
        // into it with the largest available and repeat.
        let mut inputs: Vec<Payment> = Vec::new();
        let mut exclude: Vec<u64> = Vec::new();
        let mut remaining = i64::try_from(target).map_err(|_| Error::Invariant(
            "withdrawal target overflows".to_string(),
        ))?;
        while remaining > 0 {
            if inputs.len() > outputs.len() * 2 {
                return Err(Error::TooManyInputs { needed: target });
            }
            let found = self.store.view(|tx| {
                match payments::smallest_spendable_at_least(
                    tx,
                    self.hot_mpk.id,
                    &self.coin.name,
                    remaining as u64,
                    req_height,
                    &exclude,
                )? {
                    Some(payment) => Ok::<_, ferrox_chain::Error>(Some(payment)),
                    None => payments::largest_spendable_at_most(
                        tx,
                        self.hot_mpk.id,
                        &self.coin.name,
                        remaining as u64,
                        req_height,
                        &exclude,
                    ),
                }
            })?;
            let payment = found.ok_or(Error::InsufficientInputs { needed: target })?;
            remaining -= payment.amount as i64;
            exclude.push(payment.id);
            inputs.push(payment);
        }
        if remaining != 0 {
            outputs.insert(change_address.clone(), remaining.unsigned_abs());
        }

        let miner_fee = self
            .adjust_miner_fee(&inputs, &mut outputs, &change_address)
            .await?;
        let signed_hex = self.sign_transaction(&inputs, &outputs).await?;
        Ok(BuiltTransaction {
            signed_hex,
            inputs,
            miner_fee,
            change_address,
            outputs,
        })
    }

    /// Sign once to learn the real size, then return the over-reserved
    /// fee into the change output, eliding it when it would be dust.
    pub(crate) async fn adjust_miner_fee(
        &self,
        inputs: &[Payment],
        outputs: &mut BTreeMap<String, u64>,
        change_address: &str,
    ) -> Result<u64> {
        let max_fee = self.max_miner_fee();
        let input_sum: u64 = inputs.iter().map(|p| p.amount).sum();
        let output_sum: u64 = outputs.values().sum();
        if input_sum < output_sum + max_fee {
            return Err(Error::Invariant(
                "inputs do not cover outputs plus the maximum miner fee".to_string(),
            ));
        }

        let probe = self.sign_transaction(inputs, outputs).await?;
        let kbytes = probe.len() / 2 / 1000;
        let required_base_fees = kbytes + 1;
        if required_base_fees as u64 > MAX_BASE_FEES {
            return Err(Error::FeeOverrun {
                required: required_base_fees,
                max: MAX_BASE_FEES as usize,
            });
        }
        let required_fee = required_base_fees as u64 * self.coin.miner_fee;
        if max_fee > required_fee {
            *outputs.entry(change_address.to_string()).or_insert(0) += max_fee - required_fee;
        }
        if outputs.get(change_address).copied().unwrap_or(0) < self.coin.miner_fee {
            outputs.remove(change_address);
        }
        Ok(required_fee)
    }

    pub(crate) async fn sign_transaction(
        &self,
        inputs: &[Payment],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String> {
        let keys = self.signing_keys(inputs)?;
        let rpc_inputs: Vec<_> = inputs.iter().map(|p| p.to_rpc()).collect();
        Ok(self
            .rpc
            .create_signed_raw_transaction(&self.coin.name, &rpc_inputs, outputs, &keys)
            .await?)
    }

    /// Derive the WIF signing key for every input, verifying each derived
    /// key against its registered address before use.
    fn signing_keys(&self, inputs: &[Payment]) -> Result<Vec<Protected>> {
        let mut keys = Vec::with_capacity(inputs.len());
        for input in inputs {
            let (address, mpk) = self.store.view(|tx| {
                let address = registry::load_address(tx, &input.address)?.ok_or_else(|| {
                    ferrox_chain::Error::NotFound {
                        entity: "address",
                        key: input.address.clone(),
                    }
                })?;
                let mpk = registry::load_mpk(tx, address.mpk_id)?;
                Ok::<_, ferrox_chain::Error>((address, mpk))
            })?;
            let master = self
                .hot_keys
                .get(&mpk.pub_key)
                .ok_or_else(|| Error::MissingHotKey(mpk.pub_key.clone()))?;
            let secret = self.engine.derive_private_key(
                &master,
                &mpk.chain,
                &address.chain_path,
                address.chain_idx,
            )?;
            let derived = self
                .engine
                .address_for_private_key(self.coin.addr_prefix, &secret)?;
            if derived != address.address {
                return Err(Error::KeyMismatch(address.address));
            }
            let wif = self.engine.wif(self.coin.wif_prefix, &secret, true)?;
            keys.push(Protected::new(wif.into_bytes()));
        }
        Ok(keys)
    }

    pub(crate) fn save_outbound_tx(
        &self,
        kind: OutboundKind,
        to_mpk_id: Option<u64>,
        amount: u64,
        built: &BuiltTransaction,
    ) -> Result<OutboundTx> {
        let tx_id = self.engine.txid(&built.signed_hex)?;
        self.store.serializable(|tx| {
            let id = tx.next_id("wtx")?;
            let wtx = OutboundTx {
                id,
                kind,
                coin: self.coin.name.clone(),
                from_mpk_id: Some(self.hot_mpk.id),
                to_mpk_id,
                amount,
                miner_fee: built.miner_fee,
                chg_address: built.change_address.clone(),
                raw_tx: built.signed_hex.clone(),
                tx_id: tx_id.clone(),
                time: ferrox_util::now(),
            };
            tx.put(model::wtx_key(id), &wtx)?;
            Ok::<_, Error>(wtx)
        })
    }

    fn create_change_address(&self) -> Result<String> {
        let address = registry::create_new_address(
            &self.store,
            self.engine.as_ref(),
            &self.coin,
            SYSTEM_USER,
            WALLET_CHANGE,
            &self.hot_mpk,
            &CHAINPATH_PREFIX_CHANGE.to_string(),
        )?;
        Ok(address.address)
    }

    pub(crate) fn max_miner_fee(&self) -> u64 {
        self.coin.miner_fee * MAX_BASE_FEES
    }

    /// Height at which a payment counts as fully confirmed. The tip is
    /// cached briefly to spare the node.
    pub(crate) async fn req_height(&self) -> Result<u32> {
        let now = ferrox_util::now();
        {
            let cache = self.cache_lock();
            if cache.0 != 0 && cache.0 + TIP_CACHE_SECS > now {
                return Ok((cache.1 + 1).saturating_sub(self.coin.req_conf));
            }
        }
        let tip = self.rpc.tip_height(&self.coin.name).await?;
        *self.cache_lock() = (now, tip);
        Ok((tip + 1).saturating_sub(self.coin.req_conf))
    }

    fn cache_lock(&self) -> std::sync::MutexGuard<'_, (i64, u32)> {
        match self.tip_cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn coin(&self) -> &CoinSpec {
        &self.coin
    }

    pub(crate) fn engine(&self) -> &dyn KeyDerivation {
        self.engine.as_ref()
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }
}

/// Glue for the operator key-injection surface: decode and seed the hot
/// master private key, verifying it against the configured public key
/// before anything can sign with it.
pub fn inject_master_key(
    hot_keys: &HotKeyStore,
    expected_pub_key: &str,
    secret_hex: &str,
) -> Result<()> {
    let bytes = hex::decode(secret_hex)
        .map_err(|_| Error::Invariant("master key must be hex".to_string()))?;
    let secret = Protected::new(bytes);
    let derived_pub = ferrox_crypto::public_key_hex(&secret)?;
    if derived_pub != expected_pub_key {
        return Err(Error::KeyMismatch(expected_pub_key.to_string()));
    }
    hot_keys.store(expected_pub_key, secret);
    Ok(())
}
