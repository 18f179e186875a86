//! Master key and address registry.
//!
//! Addresses are derived deterministically at the smallest unused index of
//! their `(master key, coin, chain path)` lane. Any worker may derive; the
//! insert-or-bump-and-retry loop resolves races through the uniqueness of
//! the derivation index key.

use std::collections::HashMap;

use ferrox_config::CoinSpec;
use ferrox_crypto::KeyDerivation;
use ferrox_storage::{Store, Tx};

use crate::model::{Address, Mpk, CHAINPATH_PREFIX_DEPOSIT};
use crate::rpc::RpcPayment;
use crate::{keys, Error, Result};

pub fn load_mpk(tx: &mut Tx, id: u64) -> Result<Mpk> {
    tx.get_opt(keys::mpk(id))?.ok_or(Error::NotFound {
        entity: "mpk",
        key: id.to_string(),
    })
}

pub fn load_mpk_by_pubkey(tx: &mut Tx, pub_key: &str) -> Result<Option<Mpk>> {
    let id: Option<u64> = tx.get_opt(keys::mpk_by_pubkey(pub_key))?;
    match id {
        Some(id) => Ok(Some(load_mpk(tx, id)?)),
        None => Ok(None),
    }
}

/// Register a master public key, or return the existing row. A chain code
/// mismatch against the stored row is fatal: it means the operator pointed
/// the process at the wrong wallet.
pub fn save_mpk_if_absent(store: &Store, pub_key: &str, chain: &str) -> Result<Mpk> {
    store.serializable(|tx| {
        if let Some(existing) = load_mpk_by_pubkey(tx, pub_key)? {
            if existing.chain != chain {
                return Err(Error::MpkChainMismatch(pub_key.to_string()));
            }
            return Ok(existing);
        }
        let id = tx.next_id("mpk")?;
        let mpk = Mpk {
            id,
            pub_key: pub_key.to_string(),
            chain: chain.to_string(),
        };
        tx.put(keys::mpk(id), &mpk)?;
        tx.put(keys::mpk_by_pubkey(pub_key), &id)?;
        Ok(mpk)
    })
}

pub fn load_address(tx: &mut Tx, address: &str) -> Result<Option<Address>> {
    Ok(tx.get_opt(keys::address(address))?)
}

/// Most recently derived address for `(user, wallet, coin)`.
pub fn last_address_by_wallet(
    tx: &mut Tx,
    user_id: u64,
    wallet: &str,
    coin: &str,
) -> Result<Option<Address>> {
    let rows: Vec<(Vec<u8>, String)> = tx.scan_prefix(
        keys::address_by_wallet_prefix(user_id, wallet, coin),
        true,
        Some(1),
    )?;
    match rows.into_iter().next() {
        Some((_, address)) => load_address(tx, &address),
        None => Ok(None),
    }
}

/// Which of the given payments pay known addresses.
pub fn recognized_payments(
    tx: &mut Tx,
    payments: Vec<RpcPayment>,
) -> Result<Vec<(RpcPayment, Address)>> {
    let mut known: HashMap<String, Address> = HashMap::new();
    let mut recognized = Vec::new();
    for payment in payments {
        if !known.contains_key(&payment.address) {
            if let Some(address) = load_address(tx, &payment.address)? {
                known.insert(payment.address.clone(), address);
            }
        }
        if let Some(address) = known.get(&payment.address) {
            recognized.push((payment, address.clone()));
        }
    }
    Ok(recognized)
}

fn max_address_index(tx: &mut Tx, mpk_id: u64, coin: &str, chain_path: &str) -> Result<Option<u32>> {
    let rows: Vec<(Vec<u8>, String)> = tx.scan_prefix(
        keys::address_by_derivation_prefix(mpk_id, coin, chain_path),
        true,
        Some(1),
    )?;
    match rows.into_iter().next() {
        Some((_, address)) => {
            let address = load_address(tx, &address)?.ok_or(Error::NotFound {
                entity: "address",
                key: "derivation index entry".to_string(),
            })?;
            Ok(Some(address.chain_idx))
        }
        None => Ok(None),
    }
}

/// Derive and persist a fresh address at the smallest unused index of the
/// given chain path. Keeps bumping the index until the insert wins.
pub fn create_new_address(
    store: &Store,
    engine: &dyn KeyDerivation,
    coin: &CoinSpec,
    user_id: u64,
    wallet: &str,
    mpk: &Mpk,
    chain_path: &str,
) -> Result<Address> {
    let mut index = store
        .view(|tx| max_address_index(tx, mpk.id, &coin.name, chain_path))?
        .unwrap_or(0)
        + 1;
    loop {
        let derived = engine.derive_address(
            coin.addr_prefix,
            &mpk.pub_key,
            &mpk.chain,
            chain_path,
            index,
        )?;
        let address = Address {
            address: derived,
            coin: coin.name.clone(),
            user_id,
            wallet: wallet.to_string(),
            mpk_id: mpk.id,
            chain_path: chain_path.to_string(),
            chain_idx: index,
            time: ferrox_util::now(),
        };
        let inserted = store.serializable(|tx| {
            let index_key =
                keys::address_by_derivation(mpk.id, &coin.name, chain_path, address.chain_idx);
            if tx.contains(&index_key)? || tx.contains(keys::address(&address.address))? {
                return Ok::<_, Error>(false);
            }
            tx.put(keys::address(&address.address), &address)?;
            tx.put(&index_key, &address.address)?;
            tx.put(
                keys::address_by_wallet(user_id, wallet, &coin.name, address.chain_idx),
                &address.address,
            )?;
            Ok(true)
        })?;
        if inserted {
            log::info!(
                "[{}] created address {} at {}/{} for user {} wallet {}",
                coin.name,
                address.address,
                chain_path,
                index,
                user_id,
                wallet
            );
            return Ok(address);
        }
        index += 1;
    }
}

/// The user's current deposit address, deriving the first one on demand.
pub fn load_or_create_deposit_address(
    store: &Store,
    engine: &dyn KeyDerivation,
    coin: &CoinSpec,
    user_id: u64,
    wallet: &str,
    mpk: &Mpk,
) -> Result<Address> {
    if let Some(address) =
        store.view(|tx| last_address_by_wallet(tx, user_id, wallet, &coin.name))?
    {
        return Ok(address);
    }
    // Deposit paths are `0/<chain idx>` with the per-user index fixed to
    // the user id at account creation.
    let chain_path = format!("{CHAINPATH_PREFIX_DEPOSIT}/{user_id}");
    create_new_address(store, engine, coin, user_id, wallet, mpk, &chain_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrox_config::CoinKind;
    use ferrox_crypto::KeyEngine;

    fn btc() -> CoinSpec {
        CoinSpec {
            name: "BTC".into(),
            symbol: String::new(),
            kind: CoinKind::Crypto,
            min_trade: 0,
            conf_sec: 600,
            rpc_host: "localhost".into(),
            rpc_user: String::new(),
            rpc_pass: String::new(),
            tot_conf: 6,
            req_conf: 3,
            addr_prefix: 0,
            wif_prefix: 128,
            miner_fee: 20_000,
        }
    }

    fn test_mpk(store: &Store) -> Mpk {
        let (pub_key, chain, _) = ferrox_crypto::masters_from_seed("registry test seed").unwrap();
        save_mpk_if_absent(store, &pub_key, &chain).unwrap()
    }

    #[test]
    fn mpk_registration_is_idempotent_but_chain_is_immutable() {
        let store = Store::in_memory();
        let mpk = test_mpk(&store);
        let again = save_mpk_if_absent(&store, &mpk.pub_key, &mpk.chain).unwrap();
        assert_eq!(mpk, again);

        let err = save_mpk_if_absent(&store, &mpk.pub_key, "ffff").unwrap_err();
        assert!(matches!(err, Error::MpkChainMismatch(_)));
    }

    #[test]
    fn new_addresses_take_increasing_indexes() {
        let store = Store::in_memory();
        let engine = KeyEngine::new();
        let coin = btc();
        let mpk = test_mpk(&store);

        let first = create_new_address(&store, &engine, &coin, 0, "change", &mpk, "1").unwrap();
        let second = create_new_address(&store, &engine, &coin, 0, "change", &mpk, "1").unwrap();
        assert_eq!(first.chain_idx, 1);
        assert_eq!(second.chain_idx, 2);
        assert_ne!(first.address, second.address);

        let loaded = store
            .view(|tx| load_address(tx, &second.address))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.chain_path, "1");
    }

    #[test]
    fn deposit_address_is_stable_per_user() {
        let store = Store::in_memory();
        let engine = KeyEngine::new();
        let coin = btc();
        let mpk = test_mpk(&store);

        let first =
            load_or_create_deposit_address(&store, &engine, &coin, 42, "main", &mpk).unwrap();
        let second =
            load_or_create_deposit_address(&store, &engine, &coin, 42, "main", &mpk).unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(first.chain_path, "0/42");

        let other = load_or_create_deposit_address(&store, &engine, &coin, 43, "main", &mpk).unwrap();
        assert_ne!(other.address, first.address);
    }
}
