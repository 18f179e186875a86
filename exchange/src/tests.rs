//! Matching engine scenarios: settlement, priority, windows, restart.

use std::sync::Arc;

use ferrox_config::{CoinKind, CoinSpec, Config, MarketSpec};
use ferrox_ledger::{self as ledger, WALLET_MAIN, WALLET_RESERVED_ORDER};
use ferrox_storage::Store;

use crate::model::{OrderStatus, Side};
use crate::{orders, Dispatcher, Exchange, NewOrder, Order, MAX_MEMPOOL};

const MARKET: &str = "DOGE/BTC";
const BIDDER: u64 = 1;
const ASKER: u64 = 2;

fn coin(name: &str) -> CoinSpec {
    CoinSpec {
        name: name.into(),
        symbol: String::new(),
        kind: CoinKind::Fiat,
        min_trade: 10,
        conf_sec: 0,
        rpc_host: String::new(),
        rpc_user: String::new(),
        rpc_pass: String::new(),
        tot_conf: 0,
        req_conf: 0,
        addr_prefix: 0,
        wif_prefix: 0,
        miner_fee: 0,
    }
}

fn test_config() -> Arc<Config> {
    Arc::new(Config {
        app_name: "TEST".into(),
        session_key: "test".into(),
        hot_mpk_pub_key: "unused".into(),
        hot_mpk_chain: "unused".into(),
        alert_min_interval: 600,
        coins: vec![coin("BTC"), coin("DOGE")],
        markets: vec![MarketSpec {
            coin: "DOGE".into(),
            basis_coin: "BTC".into(),
        }],
    })
}

struct Harness {
    store: Store,
    exchange: Exchange,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let store = Store::in_memory();
    let (exchange, dispatcher) = Exchange::start(store.clone(), test_config()).unwrap();
    Harness {
        store,
        exchange,
        dispatcher,
    }
}

impl Harness {
    fn fund(&self, user: u64, coin: &str, amount: i64) {
        self.store
            .serializable(|tx| ledger::adjust(tx, user, WALLET_MAIN, coin, amount, false))
            .unwrap();
    }

    fn balance(&self, user: u64, wallet: &str, coin: &str) -> i64 {
        self.store
            .view(|tx| ledger::balance_amount(tx, user, wallet, coin))
            .unwrap()
    }

    fn place(&mut self, side: Side, user: u64, amount: u64, basis_amount: u64, price: f64) -> Order {
        self.place_with_fee(side, user, amount, basis_amount, price, 0.0)
    }

    fn place_with_fee(
        &mut self,
        side: Side,
        user: u64,
        amount: u64,
        basis_amount: u64,
        price: f64,
        fee_ratio: f64,
    ) -> Order {
        let order = self
            .exchange
            .add_order(NewOrder {
                market: MARKET.into(),
                side,
                user_id: user,
                amount,
                basis_amount,
                price,
                fee_ratio,
            })
            .unwrap();
        self.dispatcher.run_pending().unwrap();
        order
    }

    fn order(&self, id: u64) -> Order {
        self.store.view(|tx| orders::load_order(tx, id)).unwrap()
    }
}

#[test]
fn crossing_orders_trade_and_settle() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 200);
    h.fund(ASKER, "DOGE", 100);

    let bid = h.place(Side::Bid, BIDDER, 0, 200, 2.0);
    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "BTC"), 0);
    assert_eq!(h.balance(BIDDER, WALLET_RESERVED_ORDER, "BTC"), 200);

    let ask = h.place(Side::Ask, ASKER, 100, 0, 2.0);

    // One trade: 100 DOGE at 2.0 = 200 BTC.
    assert_eq!(h.order(bid.id).status, OrderStatus::Complete);
    assert_eq!(h.order(ask.id).status, OrderStatus::Complete);
    assert_eq!(h.order(bid.id).basis_filled, 200);
    assert_eq!(h.order(ask.id).filled, 100);

    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "DOGE"), 100);
    assert_eq!(h.balance(ASKER, WALLET_MAIN, "BTC"), 200);
    assert_eq!(h.balance(BIDDER, WALLET_RESERVED_ORDER, "BTC"), 0);
    assert_eq!(h.balance(ASKER, WALLET_RESERVED_ORDER, "DOGE"), 0);
}

#[test]
fn fees_come_out_of_the_reserved_budget() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 202);
    h.fund(ASKER, "DOGE", 100);

    let bid = h.place_with_fee(Side::Bid, BIDDER, 0, 200, 2.0, 0.01);
    assert_eq!(h.balance(BIDDER, WALLET_RESERVED_ORDER, "BTC"), 202);
    let ask = h.place_with_fee(Side::Ask, ASKER, 100, 0, 2.0, 0.01);

    let bid = h.order(bid.id);
    let ask = h.order(ask.id);
    assert_eq!(bid.basis_fee_filled, 2);
    assert_eq!(ask.basis_fee_filled, 2);

    // The asker receives the basis minus their fee; the bidder's fee was
    // consumed from the reservation.
    assert_eq!(h.balance(ASKER, WALLET_MAIN, "BTC"), 198);
    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "DOGE"), 100);
    assert_eq!(h.balance(BIDDER, WALLET_RESERVED_ORDER, "BTC"), 0);
}

#[test]
fn equal_prices_match_oldest_first() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 100);
    h.fund(ASKER, "DOGE", 100);
    h.fund(3, "DOGE", 100);

    let first_ask = h.place(Side::Ask, ASKER, 100, 0, 1.0);
    let second_ask = h.place(Side::Ask, 3, 100, 0, 1.0);

    h.place(Side::Bid, BIDDER, 0, 100, 1.0);

    assert_eq!(h.order(first_ask.id).filled, 100);
    assert_eq!(h.order(first_ask.id).status, OrderStatus::Complete);
    assert_eq!(h.order(second_ask.id).filled, 0);
    assert_eq!(h.order(second_ask.id).status, OrderStatus::Pending);
}

#[test]
fn partial_fills_stay_on_the_book_with_updated_fills() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 300);
    h.fund(ASKER, "DOGE", 300);

    let ask = h.place(Side::Ask, ASKER, 300, 0, 1.0);
    h.place(Side::Bid, BIDDER, 0, 100, 1.0);

    let resting = h.order(ask.id);
    assert_eq!(resting.status, OrderStatus::Pending);
    assert_eq!(resting.filled, 100);

    // The in-memory copy tracks the fill too.
    let market = h.dispatcher.market(MARKET).unwrap();
    assert_eq!(market.book(Side::Ask).best().unwrap().filled, 100);

    h.place(Side::Bid, BIDDER, 0, 200, 1.0);
    assert_eq!(h.order(ask.id).status, OrderStatus::Complete);
    assert_eq!(h.balance(ASKER, WALLET_MAIN, "BTC"), 300);
}

#[test]
fn better_priced_orders_jump_the_queue() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 150);
    h.fund(ASKER, "DOGE", 100);
    h.fund(3, "DOGE", 100);

    h.place(Side::Ask, ASKER, 100, 0, 1.5);
    let cheap_ask = h.place(Side::Ask, 3, 100, 0, 1.0);

    // The bid takes the cheaper ask although it was placed later, and
    // trades at the resting order's price.
    h.place(Side::Bid, BIDDER, 0, 100, 1.5);
    assert_eq!(h.order(cheap_ask.id).filled, 100);
    assert_eq!(h.balance(3, WALLET_MAIN, "BTC"), 100);
}

#[test]
fn cancel_releases_reserves_and_is_idempotent() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 200);

    let bid = h.place(Side::Bid, BIDDER, 0, 200, 2.0);
    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "BTC"), 0);

    h.exchange.cancel_order(MARKET, bid.id).unwrap();
    h.dispatcher.run_pending().unwrap();
    assert_eq!(h.order(bid.id).status, OrderStatus::Canceled);
    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "BTC"), 200);
    assert_eq!(h.balance(BIDDER, WALLET_RESERVED_ORDER, "BTC"), 0);

    // A second cancel is a no-op.
    h.exchange.cancel_order(MARKET, bid.id).unwrap();
    h.dispatcher.run_pending().unwrap();
    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "BTC"), 200);
}

#[test]
fn orders_without_funds_are_rejected_without_residue() {
    let mut h = harness();
    h.fund(BIDDER, "BTC", 50);
    let err = h
        .exchange
        .add_order(NewOrder {
            market: MARKET.into(),
            side: Side::Bid,
            user_id: BIDDER,
            amount: 0,
            basis_amount: 200,
            price: 2.0,
            fee_ratio: 0.0,
        })
        .unwrap_err();
    assert!(matches!(
        err,
        crate::Error::Ledger(ledger::Error::InsufficientFunds)
    ));
    assert_eq!(h.dispatcher.run_pending().unwrap(), 0);
    assert_eq!(h.balance(BIDDER, WALLET_MAIN, "BTC"), 50);
}

#[test]
fn the_memory_window_stays_bounded_and_refills() {
    let mut h = harness();
    let total = MAX_MEMPOOL + 5;
    h.fund(BIDDER, "BTC", (total as i64) * 10);

    let mut ids = Vec::with_capacity(total);
    for i in 0..total {
        let order = h.place(Side::Bid, BIDDER, 0, 10, 1.0 + (i as f64) * 0.001);
        ids.push(order.id);
    }
    {
        let market = h.dispatcher.market(MARKET).unwrap();
        assert_eq!(market.book(Side::Bid).len(), MAX_MEMPOOL);
        assert!(market.has_more(Side::Bid));
    }

    // Cancel the best 401 bids; the window drains below the low-water
    // mark once and refills from storage.
    for id in ids.iter().rev().take(401) {
        h.exchange.cancel_order(MARKET, *id).unwrap();
    }
    h.dispatcher.run_pending().unwrap();

    let market = h.dispatcher.market(MARKET).unwrap();
    assert_eq!(market.book(Side::Bid).len(), total - 401);
    assert!(!market.has_more(Side::Bid));
}

#[test]
fn restart_replays_unprocessed_orders_to_the_same_state() {
    let run = |live: bool| -> (Store, Vec<u64>) {
        let store = Store::in_memory();
        let (exchange, mut dispatcher) = Exchange::start(store.clone(), test_config()).unwrap();
        store
            .serializable(|tx| {
                ledger::adjust(tx, BIDDER, WALLET_MAIN, "BTC", 400, false)?;
                ledger::adjust(tx, ASKER, WALLET_MAIN, "DOGE", 300, false)
            })
            .unwrap();

        let mut ids = Vec::new();
        for new_order in [
            NewOrder {
                market: MARKET.into(),
                side: Side::Bid,
                user_id: BIDDER,
                amount: 0,
                basis_amount: 400,
                price: 2.0,
                fee_ratio: 0.0,
            },
            NewOrder {
                market: MARKET.into(),
                side: Side::Ask,
                user_id: ASKER,
                amount: 100,
                basis_amount: 0,
                price: 2.0,
                fee_ratio: 0.0,
            },
            NewOrder {
                market: MARKET.into(),
                side: Side::Ask,
                user_id: ASKER,
                amount: 200,
                basis_amount: 0,
                price: 1.9,
                fee_ratio: 0.0,
            },
        ] {
            ids.push(exchange.add_order(new_order).unwrap().id);
            if live {
                dispatcher.run_pending().unwrap();
            }
        }
        if !live {
            // Simulated crash: the orders were saved and reserved but the
            // processor never ran. Reopening the market replays them.
            drop(dispatcher);
            let (_, replayed) = Exchange::start(store.clone(), test_config()).unwrap();
            drop(replayed);
        }
        (store, ids)
    };

    let (live_store, live_ids) = run(true);
    let (replay_store, replay_ids) = run(false);
    assert_eq!(live_ids, replay_ids);

    let snapshot = |store: &Store, ids: &[u64]| {
        let mut state = Vec::new();
        for user in [BIDDER, ASKER] {
            for coin in ["BTC", "DOGE"] {
                for wallet in [WALLET_MAIN, WALLET_RESERVED_ORDER] {
                    state.push(
                        store
                            .view(|tx| ledger::balance_amount(tx, user, wallet, coin))
                            .unwrap(),
                    );
                }
            }
        }
        for id in ids {
            let order: Order = store.view(|tx| orders::load_order(tx, *id)).unwrap();
            state.push(order.filled as i64);
            state.push(order.basis_filled as i64);
            state.push(order.status as i64);
        }
        state
    };
    assert_eq!(snapshot(&live_store, &live_ids), snapshot(&replay_store, &replay_ids));
}
