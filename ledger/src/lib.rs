//! # Ledger
//!
//! Balance accounting across per-user wallets, and the state machines for
//! deposits, withdrawals and transfers that move funds between them.
//!
//! Two layers:
//!
//! * transaction-level functions ([`adjust`], [`credit_deposit`],
//!   [`update_withdrawals`], ...) that compose inside a serializable
//!   transaction owned by a caller; the chain synchronizer and matching
//!   engine build their own transactions out of these;
//! * the [`Ledger`] facade whose methods each run one serializable
//!   transaction, for callers that want a complete operation.
//!
//! Every state transition is a guarded load-check-store: the row is loaded,
//! its status is asserted against the expected precondition, and a mismatch
//! aborts the whole transaction with no balance movement. Re-running any
//! operation after a crash is therefore safe.

use std::collections::HashMap;

use ferrox_config::Config;
use ferrox_storage::{Store, Tx};

mod error;
mod keys;
mod model;

pub use error::Error;
pub use model::*;

pub type Result<T> = std::result::Result<T, Error>;

fn to_signed(amount: u64) -> Result<i64> {
    i64::try_from(amount).map_err(|_| Error::AmountOverflow)
}

/// Add `delta` to the balance of `(user_id, wallet, coin)`, creating the
/// row on first use.
///
/// With `non_negative` set, a result below zero fails with
/// `InsufficientFunds` and the enclosing transaction must be abandoned.
pub fn adjust(
    tx: &mut Tx,
    user_id: u64,
    wallet: &str,
    coin: &str,
    delta: i64,
    non_negative: bool,
) -> Result<Balance> {
    let key = keys::balance(user_id, wallet, coin);
    let mut balance = tx.get_opt::<Balance>(&key)?.unwrap_or(Balance {
        user_id,
        wallet: wallet.to_string(),
        coin: coin.to_string(),
        amount: 0,
    });
    let amount = balance
        .amount
        .checked_add(delta)
        .ok_or(Error::AmountOverflow)?;
    if non_negative && amount < 0 {
        return Err(Error::InsufficientFunds);
    }
    balance.amount = amount;
    tx.put(&key, &balance)?;
    Ok(balance)
}

/// Current balance amount, zero when the row does not exist.
pub fn balance_amount(tx: &mut Tx, user_id: u64, wallet: &str, coin: &str) -> Result<i64> {
    let balance: Option<Balance> = tx.get_opt(keys::balance(user_id, wallet, coin))?;
    Ok(balance.map(|b| b.amount).unwrap_or(0))
}

/// All balances of one wallet of one user.
pub fn balances_by_wallet(tx: &mut Tx, user_id: u64, wallet: &str) -> Result<Vec<Balance>> {
    let rows: Vec<(Vec<u8>, Balance)> =
        tx.scan_prefix(keys::balances_by_wallet(user_id, wallet), false, None)?;
    Ok(rows.into_iter().map(|(_, balance)| balance).collect())
}

// DEPOSITS

pub fn load_deposit(tx: &mut Tx, id: u64) -> Result<Deposit> {
    tx.get_opt(keys::deposit(id))?.ok_or(Error::NotFound {
        entity: "deposit",
        id,
    })
}

/// The deposit created for a recognized payment, if any.
pub fn deposit_for_payment(tx: &mut Tx, payment_id: u64) -> Result<Option<Deposit>> {
    let id: Option<u64> = tx.get_opt(keys::deposit_by_payment(payment_id))?;
    match id {
        Some(id) => Ok(Some(load_deposit(tx, id)?)),
        None => Ok(None),
    }
}

/// Create the pending deposit row for a recognized payment. Idempotent:
/// a second call for the same payment returns the existing row untouched.
/// Does not credit anything.
pub fn create_deposit_for_payment(
    tx: &mut Tx,
    user_id: u64,
    wallet: &str,
    coin: &str,
    amount: u64,
    payment_id: u64,
) -> Result<Deposit> {
    if let Some(existing) = deposit_for_payment(tx, payment_id)? {
        return Ok(existing);
    }
    let id = tx.next_id("deposit")?;
    let now = ferrox_util::now();
    let deposit = Deposit {
        id,
        kind: DepositKind::Crypto,
        user_id,
        wallet: wallet.to_string(),
        coin: coin.to_string(),
        amount,
        payment_id: Some(payment_id),
        status: DepositStatus::Pending,
        time: now,
        updated: now,
    };
    tx.put(keys::deposit(id), &deposit)?;
    tx.put(keys::deposit_by_payment(payment_id), &id)?;
    tx.put(keys::deposit_by_user(user_id, id), &id)?;
    Ok(deposit)
}

/// Most recent deposits of a user, newest first.
pub fn deposits_by_user(tx: &mut Tx, user_id: u64, limit: usize) -> Result<Vec<Deposit>> {
    let ids: Vec<(Vec<u8>, u64)> =
        tx.scan_prefix(keys::deposit_by_user_prefix(user_id), true, Some(limit))?;
    ids.into_iter()
        .map(|(_, id)| load_deposit(tx, id))
        .collect()
}

/// Most recent withdrawals of a user, newest first.
pub fn withdrawals_by_user(tx: &mut Tx, user_id: u64, limit: usize) -> Result<Vec<Withdrawal>> {
    let ids: Vec<(Vec<u8>, u64)> =
        tx.scan_prefix(keys::withdrawal_by_user_prefix(user_id), true, Some(limit))?;
    ids.into_iter()
        .map(|(_, id)| load_withdrawal(tx, id))
        .collect()
}

/// Credit the user's account for a pending deposit. Returns `false` (and
/// does nothing) when the deposit is not pending. Idempotent.
pub fn credit_deposit(tx: &mut Tx, deposit_id: u64) -> Result<bool> {
    let mut deposit = load_deposit(tx, deposit_id)?;
    if deposit.status != DepositStatus::Pending {
        return Ok(false);
    }
    adjust(
        tx,
        deposit.user_id,
        &deposit.wallet,
        &deposit.coin,
        to_signed(deposit.amount)?,
        false,
    )?;
    deposit.status = DepositStatus::Credited;
    deposit.updated = ferrox_util::now();
    tx.put(keys::deposit(deposit_id), &deposit)?;
    Ok(true)
}

/// Take back a credited deposit. Returns the resulting balance when funds
/// moved, `None` when the deposit was not credited. The balance may go
/// negative when the user already spent the funds; callers decide what to
/// do about that. Idempotent.
pub fn uncredit_deposit(tx: &mut Tx, deposit_id: u64) -> Result<Option<Balance>> {
    let mut deposit = load_deposit(tx, deposit_id)?;
    if deposit.status != DepositStatus::Credited {
        return Ok(None);
    }
    let balance = adjust(
        tx,
        deposit.user_id,
        &deposit.wallet,
        &deposit.coin,
        -to_signed(deposit.amount)?,
        false,
    )?;
    deposit.status = DepositStatus::Pending;
    deposit.updated = ferrox_util::now();
    tx.put(keys::deposit(deposit_id), &deposit)?;
    Ok(Some(balance))
}

// WITHDRAWALS

pub fn load_withdrawal(tx: &mut Tx, id: u64) -> Result<Withdrawal> {
    tx.get_opt(keys::withdrawal(id))?.ok_or(Error::NotFound {
        entity: "withdrawal",
        id,
    })
}

/// Withdrawals of one coin in one status, oldest first.
pub fn withdrawals_by_status(
    tx: &mut Tx,
    coin: &str,
    status: WithdrawalStatus,
    limit: usize,
) -> Result<Vec<Withdrawal>> {
    let ids: Vec<(Vec<u8>, u64)> = tx.scan_prefix(
        keys::withdrawal_status_prefix(coin, status),
        false,
        Some(limit),
    )?;
    ids.into_iter()
        .map(|(_, id)| load_withdrawal(tx, id))
        .collect()
}

/// Transition a set of withdrawals `old_status -> new_status`, asserting
/// that every one of them is currently in `old_status`. A mismatch aborts
/// the transaction; this is the idempotence guard for the whole treasury
/// protocol.
pub fn update_withdrawals(
    tx: &mut Tx,
    ids: &[u64],
    old_status: WithdrawalStatus,
    new_status: WithdrawalStatus,
    wtx_id: Option<u64>,
) -> Result<Vec<Withdrawal>> {
    let now = ferrox_util::now();
    let mut updated = Vec::with_capacity(ids.len());
    for &id in ids {
        let mut withdrawal = load_withdrawal(tx, id)?;
        if withdrawal.status != old_status {
            return Err(Error::UnexpectedWithdrawalStatus {
                id,
                expected: old_status,
                actual: withdrawal.status,
            });
        }
        tx.delete(keys::withdrawal_status(&withdrawal.coin, old_status, id));
        withdrawal.status = new_status;
        if wtx_id.is_some() {
            withdrawal.wtx_id = wtx_id;
        }
        withdrawal.updated = now;
        tx.put(keys::withdrawal(id), &withdrawal)?;
        tx.put(
            keys::withdrawal_status(&withdrawal.coin, new_status, id),
            &id,
        )?;
        updated.push(withdrawal);
    }
    Ok(updated)
}

/// The ledger facade: one serializable transaction per operation.
#[derive(Clone)]
pub struct Ledger {
    store: Store,
}

impl Ledger {
    pub fn new(store: Store) -> Self {
        Ledger { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Reserve `amount` from `main` and record a pending withdrawal.
    pub fn add_withdrawal(
        &self,
        user_id: u64,
        to_address: &str,
        coin: &str,
        amount: u64,
    ) -> Result<Withdrawal> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }
        self.store.serializable(|tx| {
            let id = tx.next_id("withdrawal")?;
            let now = ferrox_util::now();
            let withdrawal = Withdrawal {
                id,
                user_id,
                wallet: WALLET_MAIN.to_string(),
                coin: coin.to_string(),
                to_address: to_address.to_string(),
                amount,
                approved: 0,
                status: WithdrawalStatus::Pending,
                wtx_id: None,
                time: now,
                updated: now,
            };
            tx.put(keys::withdrawal(id), &withdrawal)?;
            tx.put(
                keys::withdrawal_status(coin, WithdrawalStatus::Pending, id),
                &id,
            )?;
            tx.put(keys::withdrawal_by_user(user_id, id), &id)?;
            adjust(tx, user_id, WALLET_MAIN, coin, -to_signed(amount)?, true)?;
            adjust(
                tx,
                user_id,
                WALLET_RESERVED_WITHDRAWAL,
                coin,
                to_signed(amount)?,
                false,
            )?;
            Ok(withdrawal)
        })
    }

    /// Cancel a pending withdrawal, releasing the reservation.
    pub fn cancel_withdrawal(&self, withdrawal: &Withdrawal) -> Result<Withdrawal> {
        self.store.serializable(|tx| {
            let updated = update_withdrawals(
                tx,
                &[withdrawal.id],
                WithdrawalStatus::Pending,
                WithdrawalStatus::Canceled,
                None,
            )?;
            adjust(
                tx,
                withdrawal.user_id,
                WALLET_RESERVED_WITHDRAWAL,
                &withdrawal.coin,
                -to_signed(withdrawal.amount)?,
                true,
            )?;
            adjust(
                tx,
                withdrawal.user_id,
                WALLET_MAIN,
                &withdrawal.coin,
                to_signed(withdrawal.amount)?,
                false,
            )?;
            Ok(updated.into_iter().next().expect("one id updated"))
        })
    }

    /// Atomically claim up to `limit` pending withdrawals for processing.
    pub fn checkout_withdrawals(&self, coin: &str, limit: usize) -> Result<Vec<Withdrawal>> {
        self.store.serializable(|tx| {
            let pending = withdrawals_by_status(tx, coin, WithdrawalStatus::Pending, limit)?;
            let ids: Vec<u64> = pending.iter().map(|w| w.id).collect();
            update_withdrawals(
                tx,
                &ids,
                WithdrawalStatus::Pending,
                WithdrawalStatus::CheckedOut,
                None,
            )
        })
    }

    /// Mark checked-out withdrawals complete and release the reservations.
    pub fn complete_withdrawals(&self, withdrawals: &[Withdrawal], wtx_id: u64) -> Result<()> {
        let ids: Vec<u64> = withdrawals.iter().map(|w| w.id).collect();
        self.store.serializable(|tx| {
            update_withdrawals(
                tx,
                &ids,
                WithdrawalStatus::CheckedOut,
                WithdrawalStatus::Complete,
                Some(wtx_id),
            )?;
            for withdrawal in withdrawals {
                adjust(
                    tx,
                    withdrawal.user_id,
                    WALLET_RESERVED_WITHDRAWAL,
                    &withdrawal.coin,
                    -to_signed(withdrawal.amount)?,
                    true,
                )?;
            }
            Ok(())
        })
    }

    /// Park checked-out withdrawals that could not be processed.
    pub fn stall_withdrawals(&self, ids: &[u64]) -> Result<()> {
        self.store.serializable(|tx| {
            update_withdrawals(
                tx,
                ids,
                WithdrawalStatus::CheckedOut,
                WithdrawalStatus::Stalled,
                None,
            )?;
            Ok(())
        })
    }

    /// Return stalled withdrawals to the pending queue (operator action).
    pub fn resume_withdrawals(&self, ids: &[u64]) -> Result<()> {
        self.store.serializable(|tx| {
            update_withdrawals(
                tx,
                ids,
                WithdrawalStatus::Stalled,
                WithdrawalStatus::Pending,
                None,
            )?;
            Ok(())
        })
    }

    /// Record a fiat deposit. Does not credit anything.
    pub fn create_fiat_deposit(
        &self,
        user_id: u64,
        wallet: &str,
        coin: &str,
        amount: u64,
    ) -> Result<Deposit> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }
        self.store.serializable(|tx| {
            let id = tx.next_id("deposit")?;
            let now = ferrox_util::now();
            let deposit = Deposit {
                id,
                kind: DepositKind::Fiat,
                user_id,
                wallet: wallet.to_string(),
                coin: coin.to_string(),
                amount,
                payment_id: None,
                status: DepositStatus::Pending,
                time: now,
                updated: now,
            };
            tx.put(keys::deposit(id), &deposit)?;
            tx.put(keys::deposit_by_user(user_id, id), &id)?;
            Ok(deposit)
        })
    }

    /// Credit a deposit by id (fiat flow; crypto deposits are credited by
    /// the chain synchronizer at confirmation depth).
    pub fn credit_deposit(&self, deposit_id: u64) -> Result<bool> {
        self.store.serializable(|tx| credit_deposit(tx, deposit_id))
    }

    /// Uncredit a deposit by id.
    pub fn uncredit_deposit(&self, deposit_id: u64) -> Result<Option<Balance>> {
        self.store.serializable(|tx| uncredit_deposit(tx, deposit_id))
    }

    /// Move funds between wallets, possibly across users.
    pub fn transfer(
        &self,
        user_id: u64,
        wallet: &str,
        to_user_id: u64,
        to_wallet: &str,
        coin: &str,
        amount: u64,
    ) -> Result<Transfer> {
        if amount == 0 {
            return Err(Error::InvalidAmount);
        }
        self.store.serializable(|tx| {
            adjust(tx, user_id, wallet, coin, -to_signed(amount)?, true)?;
            adjust(tx, to_user_id, to_wallet, coin, to_signed(amount)?, false)?;
            let id = tx.next_id("transfer")?;
            let transfer = Transfer {
                id,
                user_id,
                wallet: wallet.to_string(),
                to_user_id,
                to_wallet: to_wallet.to_string(),
                coin: coin.to_string(),
                amount,
                fee: 0,
                time: ferrox_util::now(),
            };
            tx.put(keys::transfer(id), &transfer)?;
            Ok(transfer)
        })
    }

    /// Balance map for one wallet, padded with zeros for every configured
    /// coin.
    pub fn balance_map(
        &self,
        config: &Config,
        user_id: u64,
        wallet: &str,
    ) -> Result<HashMap<String, i64>> {
        let balances = self
            .store
            .view(|tx| balances_by_wallet(tx, user_id, wallet))?;
        let mut map: HashMap<String, i64> = balances
            .into_iter()
            .map(|balance| (balance.coin, balance.amount))
            .collect();
        for coin in &config.coins {
            map.entry(coin.name.clone()).or_insert(0);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrox_util::math::SATOSHI;

    const BTC: &str = "BTC";
    const USER: u64 = 7;

    fn funded_ledger(amount: i64) -> Ledger {
        let ledger = Ledger::new(Store::in_memory());
        ledger
            .store
            .serializable(|tx| adjust(tx, USER, WALLET_MAIN, BTC, amount, false))
            .unwrap();
        ledger
    }

    fn amounts(ledger: &Ledger, user: u64) -> (i64, i64, i64) {
        ledger
            .store
            .view(|tx| {
                Ok::<_, Error>((
                    balance_amount(tx, user, WALLET_MAIN, BTC)?,
                    balance_amount(tx, user, WALLET_RESERVED_WITHDRAWAL, BTC)?,
                    balance_amount(tx, user, WALLET_RESERVED_ORDER, BTC)?,
                ))
            })
            .unwrap()
    }

    #[test]
    fn withdraw_reserves_and_cancel_restores() {
        let ledger = funded_ledger(SATOSHI);

        let withdrawal = ledger
            .add_withdrawal(USER, "1SomeAddress", BTC, SATOSHI as u64)
            .unwrap();
        assert_eq!(amounts(&ledger, USER), (0, SATOSHI, 0));

        let canceled = ledger.cancel_withdrawal(&withdrawal).unwrap();
        assert_eq!(canceled.status, WithdrawalStatus::Canceled);
        assert_eq!(amounts(&ledger, USER), (SATOSHI, 0, 0));
    }

    #[test]
    fn overdraft_rejected_without_partial_writes() {
        let ledger = funded_ledger(100);
        let err = ledger.add_withdrawal(USER, "1Addr", BTC, 101).unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
        assert_eq!(amounts(&ledger, USER), (100, 0, 0));
        // No withdrawal row was left behind either.
        let pending = ledger.checkout_withdrawals(BTC, 10).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn checkout_complete_protocol() {
        let ledger = funded_ledger(1_000);
        ledger.add_withdrawal(USER, "1A", BTC, 300).unwrap();
        ledger.add_withdrawal(USER, "1B", BTC, 200).unwrap();

        let checked_out = ledger.checkout_withdrawals(BTC, 10).unwrap();
        assert_eq!(checked_out.len(), 2);
        assert!(checked_out
            .iter()
            .all(|w| w.status == WithdrawalStatus::CheckedOut));

        // The queue is drained; a second checkout claims nothing.
        assert!(ledger.checkout_withdrawals(BTC, 10).unwrap().is_empty());

        ledger.complete_withdrawals(&checked_out, 42).unwrap();
        assert_eq!(amounts(&ledger, USER), (500, 0, 0));
        let completed = ledger
            .store
            .view(|tx| load_withdrawal(tx, checked_out[0].id))
            .unwrap();
        assert_eq!(completed.status, WithdrawalStatus::Complete);
        assert_eq!(completed.wtx_id, Some(42));
    }

    #[test]
    fn stall_and_resume_requeues() {
        let ledger = funded_ledger(1_000);
        ledger.add_withdrawal(USER, "1A", BTC, 300).unwrap();
        let checked_out = ledger.checkout_withdrawals(BTC, 10).unwrap();
        let ids: Vec<u64> = checked_out.iter().map(|w| w.id).collect();

        ledger.stall_withdrawals(&ids).unwrap();
        assert!(ledger.checkout_withdrawals(BTC, 10).unwrap().is_empty());

        ledger.resume_withdrawals(&ids).unwrap();
        let again = ledger.checkout_withdrawals(BTC, 10).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, ids[0]);
    }

    #[test]
    fn double_cancel_is_rejected_by_the_status_guard() {
        let ledger = funded_ledger(1_000);
        let withdrawal = ledger.add_withdrawal(USER, "1A", BTC, 300).unwrap();
        ledger.cancel_withdrawal(&withdrawal).unwrap();
        let err = ledger.cancel_withdrawal(&withdrawal).unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedWithdrawalStatus {
                actual: WithdrawalStatus::Canceled,
                ..
            }
        ));
        // Balances are untouched by the failed second cancel.
        assert_eq!(amounts(&ledger, USER), (1_000, 0, 0));
    }

    #[test]
    fn deposit_credit_is_idempotent() {
        let ledger = Ledger::new(Store::in_memory());
        let deposit = ledger.create_fiat_deposit(USER, WALLET_MAIN, BTC, 500).unwrap();

        assert!(ledger.credit_deposit(deposit.id).unwrap());
        assert!(!ledger.credit_deposit(deposit.id).unwrap());
        assert_eq!(amounts(&ledger, USER).0, 500);

        let balance = ledger.uncredit_deposit(deposit.id).unwrap().unwrap();
        assert_eq!(balance.amount, 0);
        assert!(ledger.uncredit_deposit(deposit.id).unwrap().is_none());
    }

    #[test]
    fn uncredit_after_spend_goes_negative() {
        let ledger = Ledger::new(Store::in_memory());
        let deposit = ledger.create_fiat_deposit(USER, WALLET_MAIN, BTC, 500).unwrap();
        ledger.credit_deposit(deposit.id).unwrap();
        // The user spends the funds elsewhere.
        ledger
            .store
            .serializable(|tx| adjust(tx, USER, WALLET_MAIN, BTC, -400, true))
            .unwrap();

        let balance = ledger.uncredit_deposit(deposit.id).unwrap().unwrap();
        assert_eq!(balance.amount, -300);
    }

    #[test]
    fn payment_deposits_are_created_once() {
        let store = Store::in_memory();
        let first: Deposit = store
            .serializable(|tx| create_deposit_for_payment(tx, USER, WALLET_MAIN, BTC, 250, 99))
            .unwrap();
        let second: Deposit = store
            .serializable(|tx| create_deposit_for_payment(tx, USER, WALLET_MAIN, BTC, 250, 99))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.payment_id, Some(99));
    }

    #[test]
    fn transfer_conserves_funds() {
        let ledger = funded_ledger(1_000);
        ledger
            .transfer(USER, WALLET_MAIN, 8, WALLET_MAIN, BTC, 400)
            .unwrap();
        assert_eq!(amounts(&ledger, USER).0, 600);
        assert_eq!(amounts(&ledger, 8).0, 400);
        let err = ledger
            .transfer(USER, WALLET_MAIN, 8, WALLET_MAIN, BTC, 601)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds));
    }
}
