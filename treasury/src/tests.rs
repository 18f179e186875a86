//! Treasury scenarios against the simulated chain: withdrawal processing,
//! stalling, input bounds and sweeps.

use std::sync::Arc;

use ferrox_chain::model::{Mpk, SpentStatus};
use ferrox_chain::rpc::{ChainRpc, RpcPayment};
use ferrox_chain::testing::SimChain;
use ferrox_chain::{payments, registry};
use ferrox_config::{CoinKind, CoinSpec};
use ferrox_crypto::KeyEngine;
use ferrox_ledger::{
    self as ledger, Ledger, WithdrawalStatus, SYSTEM_USER, WALLET_CHANGE, WALLET_MAIN,
};
use ferrox_storage::Store;
use ferrox_util::{Alerter, LogAlertSink};

use crate::{inject_master_key, Error, HotKeyStore, OutboundKind, Treasury};

const COIN: &str = "BTC";
const USER: u64 = 7;
const MINER_FEE: u64 = 20_000;

fn coin_spec() -> CoinSpec {
    CoinSpec {
        name: COIN.into(),
        symbol: String::new(),
        kind: CoinKind::Crypto,
        min_trade: 40_000,
        conf_sec: 600,
        rpc_host: "sim".into(),
        rpc_user: String::new(),
        rpc_pass: String::new(),
        tot_conf: 6,
        req_conf: 3,
        addr_prefix: 0,
        wif_prefix: 128,
        miner_fee: MINER_FEE,
    }
}

struct Harness {
    store: Store,
    ledger: Ledger,
    sim: Arc<SimChain>,
    treasury: Treasury,
    hot_mpk: Mpk,
    engine: Arc<KeyEngine>,
}

fn harness() -> Harness {
    let store = Store::in_memory();
    let ledger = Ledger::new(store.clone());
    let engine = Arc::new(KeyEngine::new());
    let (pub_key, chain, secret) = ferrox_crypto::masters_from_seed("treasury test seed").unwrap();
    let hot_mpk = registry::save_mpk_if_absent(&store, &pub_key, &chain).unwrap();

    let hot_keys = Arc::new(HotKeyStore::new());
    inject_master_key(&hot_keys, &pub_key, &hex::encode(secret.as_bytes())).unwrap();

    // Tip at height 12 makes height-10 payments fully confirmed (N=3).
    let sim = Arc::new(SimChain::new(COIN, 10));
    sim.push_block(vec![]);
    sim.push_block(vec![]);
    sim.push_block(vec![]);

    let treasury = Treasury::new(
        coin_spec(),
        store.clone(),
        ledger.clone(),
        sim.clone() as Arc<dyn ChainRpc>,
        engine.clone(),
        hot_keys,
        hot_mpk.clone(),
        Arc::new(Alerter::new("TEST", 600, Box::new(LogAlertSink))),
    );
    Harness {
        store,
        ledger,
        sim,
        treasury,
        hot_mpk,
        engine,
    }
}

impl Harness {
    /// Register a confirmed hot-wallet payment of `amount`.
    fn fund_hot_wallet(&self, tx_id: &str, amount: u64) {
        let address = registry::create_new_address(
            &self.store,
            self.engine.as_ref(),
            &coin_spec(),
            USER,
            WALLET_MAIN,
            &self.hot_mpk,
            &format!("0/{USER}"),
        )
        .unwrap();
        let rpc_payment = RpcPayment {
            coin: COIN.into(),
            tx_id: tx_id.into(),
            vout: 0,
            blockhash: Some("blk-funding".into()),
            blockheight: Some(10),
            address: address.address,
            amount,
            script_pk: "00".into(),
            time: 6_000,
        };
        self.store
            .serializable(|tx| payments::upsert_payment(tx, &rpc_payment, self.hot_mpk.id))
            .unwrap();
    }

    fn fund_user(&self, amount: i64) {
        self.store
            .serializable(|tx| ledger::adjust(tx, USER, WALLET_MAIN, COIN, amount, false))
            .unwrap();
    }

    fn balance(&self, user: u64, wallet: &str) -> i64 {
        self.store
            .view(|tx| ledger::balance_amount(tx, user, wallet, COIN))
            .unwrap()
    }
}

#[tokio::test]
async fn withdrawal_is_built_broadcast_and_completed() {
    let h = harness();
    h.fund_hot_wallet("fund-tx", 150_000_000);
    h.fund_user(100_000_000);
    let withdrawal = h
        .ledger
        .add_withdrawal(USER, "1DestinationAddress", COIN, 100_000_000)
        .unwrap();

    assert!(h.treasury.process_user_withdrawals().await.unwrap());

    let done = h
        .store
        .view(|tx| ledger::load_withdrawal(tx, withdrawal.id))
        .unwrap();
    assert_eq!(done.status, WithdrawalStatus::Complete);
    assert!(done.wtx_id.is_some());

    assert_eq!(h.sim.broadcasts().len(), 1);
    assert_eq!(h.balance(USER, WALLET_MAIN), 0);
    assert_eq!(h.balance(USER, ledger::WALLET_RESERVED_WITHDRAWAL), 0);

    // One input of 150M against 100M withdrawn: the change output gets
    // 49.8M plus the refunded 9 of 10 over-reserved base fees.
    assert_eq!(h.balance(SYSTEM_USER, WALLET_CHANGE), -49_980_000);

    let spent = h
        .store
        .view(|tx| payments::load_payment_by_outpoint(tx, "fund-tx", 0))
        .unwrap()
        .unwrap();
    assert_eq!(spent.spent, SpentStatus::Spent);
    assert_eq!(spent.wtx_id, done.wtx_id);
}

#[tokio::test]
async fn second_tick_with_nothing_pending_is_a_noop() {
    let h = harness();
    h.fund_hot_wallet("fund-tx", 150_000_000);
    h.fund_user(100_000_000);
    h.ledger
        .add_withdrawal(USER, "1DestinationAddress", COIN, 100_000_000)
        .unwrap();
    assert!(h.treasury.process_user_withdrawals().await.unwrap());
    assert!(!h.treasury.process_user_withdrawals().await.unwrap());
    assert_eq!(h.sim.broadcasts().len(), 1);
}

#[tokio::test]
async fn insufficient_liquidity_stalls_the_batch() {
    let h = harness();
    h.fund_hot_wallet("fund-tx", 150_000_000);
    h.fund_user(200_000_000);
    let withdrawal = h
        .ledger
        .add_withdrawal(USER, "1DestinationAddress", COIN, 200_000_000)
        .unwrap();

    let err = h.treasury.process_user_withdrawals().await.unwrap_err();
    assert!(matches!(err, Error::InsufficientInputs { .. }));

    let stalled = h
        .store
        .view(|tx| ledger::load_withdrawal(tx, withdrawal.id))
        .unwrap();
    assert_eq!(stalled.status, WithdrawalStatus::Stalled);
    assert!(h.sim.broadcasts().is_empty());

    // The reservation stays; resuming requeues the withdrawal.
    assert_eq!(h.balance(USER, ledger::WALLET_RESERVED_WITHDRAWAL), 200_000_000);
    h.ledger.resume_withdrawals(&[withdrawal.id]).unwrap();
    let resumed = h
        .store
        .view(|tx| ledger::load_withdrawal(tx, withdrawal.id))
        .unwrap();
    assert_eq!(resumed.status, WithdrawalStatus::Pending);
}

#[tokio::test]
async fn input_count_is_bounded_by_output_count() {
    let h = harness();
    for i in 0..4 {
        h.fund_hot_wallet(&format!("fund-tx-{i}"), 40_000_000);
    }
    h.fund_user(150_000_000);
    h.ledger
        .add_withdrawal(USER, "1DestinationAddress", COIN, 150_000_000)
        .unwrap();

    let err = h.treasury.process_user_withdrawals().await.unwrap_err();
    assert!(matches!(err, Error::TooManyInputs { .. }));
    assert!(h.sim.broadcasts().is_empty());
}

#[tokio::test]
async fn sweep_collects_computes_and_broadcasts() {
    let h = harness();
    for i in 0..5 {
        h.fund_hot_wallet(&format!("sweep-in-{i}"), 30_000_000);
    }
    let (cold_pub, cold_chain, _) = ferrox_crypto::masters_from_seed("cold storage seed").unwrap();
    let cold_mpk = registry::save_mpk_if_absent(&h.store, &cold_pub, &cold_chain).unwrap();

    let (inputs, total) = h
        .treasury
        .collect_sweep_inputs(&h.hot_mpk, 1_000_000, 100_000_000, 200_000_000, 10)
        .await
        .unwrap();
    assert_eq!(inputs.len(), 5);
    assert_eq!(total, 150_000_000);

    let built = h
        .treasury
        .compute_sweep_transaction(&inputs, &cold_mpk, 10_000_000, 80_000_000, 10, false)
        .await
        .unwrap();
    assert_eq!(built.outputs.len(), 3);
    let output_sum: u64 = built.outputs.values().sum();
    assert_eq!(output_sum + built.miner_fee, total);

    let wtx = h.treasury.broadcast_sweep(&built, &cold_mpk).await.unwrap();
    assert_eq!(wtx.kind, OutboundKind::Sweep);
    assert_eq!(h.sim.broadcasts().len(), 1);
    for input in &inputs {
        let spent = h
            .store
            .view(|tx| payments::load_payment(tx, input.id))
            .unwrap();
        assert_eq!(spent.spent, SpentStatus::Spent);
        assert_eq!(spent.wtx_id, Some(wtx.id));
    }
}

#[tokio::test]
async fn dry_run_sweep_uses_throwaway_addresses_but_same_amounts() {
    let h = harness();
    for i in 0..5 {
        h.fund_hot_wallet(&format!("sweep-in-{i}"), 30_000_000);
    }
    let (cold_pub, cold_chain, _) = ferrox_crypto::masters_from_seed("cold storage seed").unwrap();
    let cold_mpk = registry::save_mpk_if_absent(&h.store, &cold_pub, &cold_chain).unwrap();
    let (inputs, _) = h
        .treasury
        .collect_sweep_inputs(&h.hot_mpk, 1_000_000, 100_000_000, 200_000_000, 10)
        .await
        .unwrap();

    let dry = h
        .treasury
        .compute_sweep_transaction(&inputs, &cold_mpk, 10_000_000, 80_000_000, 10, true)
        .await
        .unwrap();
    let real = h
        .treasury
        .compute_sweep_transaction(&inputs, &cold_mpk, 10_000_000, 80_000_000, 10, false)
        .await
        .unwrap();

    let mut dry_amounts: Vec<u64> = dry.outputs.values().copied().collect();
    let mut real_amounts: Vec<u64> = real.outputs.values().copied().collect();
    dry_amounts.sort_unstable();
    real_amounts.sort_unstable();
    assert_eq!(dry_amounts, real_amounts);

    let dry_addresses = h
        .store
        .view(|tx| {
            let mut found = Vec::new();
            for address in dry.outputs.keys() {
                found.push(registry::load_address(tx, address)?.unwrap());
            }
            Ok::<_, ferrox_chain::Error>(found)
        })
        .unwrap();
    for address in dry_addresses {
        assert_eq!(address.chain_path, "102");
        assert_eq!(address.wallet, ledger::WALLET_SWEEP_DRY);
    }
}
