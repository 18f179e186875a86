//! Process wiring: configuration, storage, worker spawning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};

use ferrox_chain::{registry, ChainSync};
use ferrox_chain::rpc::ChainRpc;
use ferrox_config::Config;
use ferrox_crypto::{KeyDerivation, KeyEngine};
use ferrox_exchange::Exchange;
use ferrox_ledger::Ledger;
use ferrox_storage::Store;
use ferrox_treasury::{inject_master_key, HotKeyStore, Treasury};
use ferrox_util::{Alerter, LogAlertSink};

use crate::rpc_client::NodeRpc;

/// Environment variable through which the operator injects the hot
/// master private key (hex). The key never touches disk or storage.
const MASTER_KEY_ENV: &str = "FERROX_MASTER_KEY";

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".ferrox").join("config.json")
}

/// Load the configuration, bootstrapping a template on first run.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        ferrox_config::write_default(path)?;
        bail!(
            "configuration template written to {}; edit it and run again",
            path.display()
        );
    }
    Config::from_file(path).with_context(|| format!("loading {}", path.display()))
}

pub fn open_store(data_dir: Option<&Path>) -> anyhow::Result<Store> {
    #[cfg(feature = "rocksdb-backend")]
    {
        let dir = data_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_config_path().with_file_name("data"));
        let backend = ferrox_storage::backends::rocks::RocksBackend::open(
            dir.to_str().context("data dir is not valid utf-8")?,
        )?;
        return Ok(Store::with_backend(Box::new(backend)));
    }
    #[cfg(not(feature = "rocksdb-backend"))]
    {
        if data_dir.is_some() {
            log::warn!("--data-dir ignored: built without the rocksdb backend");
        }
        log::warn!("using in-memory storage; state will not survive a restart");
        Ok(Store::in_memory())
    }
}

struct Runtime {
    config: Arc<Config>,
    store: Store,
    ledger: Ledger,
    engine: Arc<KeyEngine>,
    hot_keys: Arc<HotKeyStore>,
    hot_mpk: ferrox_chain::Mpk,
    alerter: Arc<Alerter>,
}

fn bootstrap(config: Config, store: Store) -> anyhow::Result<Runtime> {
    let config = Arc::new(config);
    let hot_mpk =
        registry::save_mpk_if_absent(&store, &config.hot_mpk_pub_key, &config.hot_mpk_chain)?;
    let hot_keys = Arc::new(HotKeyStore::new());
    match std::env::var(MASTER_KEY_ENV) {
        Ok(secret_hex) => {
            inject_master_key(&hot_keys, &config.hot_mpk_pub_key, &secret_hex)?;
            log::info!("hot master private key injected from {MASTER_KEY_ENV}");
        }
        Err(_) => log::warn!(
            "{MASTER_KEY_ENV} not set; the treasury will idle until the key is injected"
        ),
    }
    Ok(Runtime {
        alerter: Arc::new(Alerter::new(
            config.app_name.clone(),
            config.alert_min_interval,
            Box::new(LogAlertSink),
        )),
        ledger: Ledger::new(store.clone()),
        engine: Arc::new(KeyEngine::new()),
        hot_keys,
        hot_mpk,
        store,
        config,
    })
}

/// Run the full node until interrupted.
pub async fn run(config: Config, data_dir: Option<&Path>) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let rt = bootstrap(config, store)?;

    for coin in rt.config.crypto_coins() {
        let rpc: Arc<dyn ChainRpc> = Arc::new(NodeRpc::new(coin));

        let sync = ChainSync::new(
            coin.clone(),
            rt.store.clone(),
            rpc.clone(),
            rt.alerter.clone(),
        );
        tokio::spawn(sync.run());

        let treasury = Treasury::new(
            coin.clone(),
            rt.store.clone(),
            rt.ledger.clone(),
            rpc,
            rt.engine.clone() as Arc<dyn KeyDerivation>,
            rt.hot_keys.clone(),
            rt.hot_mpk.clone(),
            rt.alerter.clone(),
        );
        tokio::spawn(treasury.run());
    }

    let (_exchange, dispatcher) = Exchange::start(rt.store.clone(), rt.config.clone())?;
    tokio::spawn(dispatcher.run());

    log::info!("ferrox node started");
    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    Ok(())
}

/// Operator sweep: collect inputs, build the transaction, print it, and
/// optionally broadcast.
#[allow(clippy::too_many_arguments)]
pub async fn sweep(
    config: Config,
    data_dir: Option<&Path>,
    coin_name: &str,
    out_pub_key: &str,
    out_chain: &str,
    min_input: u64,
    max_input: u64,
    max_total: u64,
    max_inputs: usize,
    min_output: u64,
    max_output: u64,
    max_outputs: usize,
    broadcast: bool,
) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let rt = bootstrap(config, store)?;
    let coin = rt.config.coin(coin_name)?.clone();
    if !coin.is_crypto() {
        bail!("{coin_name} is not a chain-backed coin");
    }

    let out_mpk = registry::save_mpk_if_absent(&rt.store, out_pub_key, out_chain)?;
    let rpc: Arc<dyn ChainRpc> = Arc::new(NodeRpc::new(&coin));
    let treasury = Treasury::new(
        coin,
        rt.store.clone(),
        rt.ledger.clone(),
        rpc,
        rt.engine.clone() as Arc<dyn KeyDerivation>,
        rt.hot_keys.clone(),
        rt.hot_mpk.clone(),
        rt.alerter.clone(),
    );

    let (inputs, total) = treasury
        .collect_sweep_inputs(treasury.hot_mpk(), min_input, max_input, max_total, max_inputs)
        .await?;
    println!("collected {} inputs totalling {total}", inputs.len());

    let built = treasury
        .compute_sweep_transaction(
            &inputs,
            &out_mpk,
            min_output,
            max_output,
            max_outputs,
            !broadcast,
        )
        .await?;
    println!("miner fee: {}", built.miner_fee);
    for (address, amount) in &built.outputs {
        println!("output {address} {amount}");
    }
    println!("signed tx: {}", built.signed_hex);

    if broadcast {
        let wtx = treasury.broadcast_sweep(&built, &out_mpk).await?;
        println!("broadcast as {}", wtx.tx_id);
    } else {
        println!("dry run; nothing broadcast");
    }
    Ok(())
}
