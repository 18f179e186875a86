//! Process configuration.
//!
//! Everything an operator can tune lives in a single JSON document so that
//! tooling in other languages can read and generate it. A missing file is
//! bootstrapped with [`write_default`] and the process exits so the
//! operator can fill in the placeholders.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

mod error;

pub use error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Kind of a supported coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoinKind {
    /// Chain-backed coin with its own node daemon.
    #[serde(rename = "C")]
    Crypto,
    /// Fiat currency, deposited and withdrawn out of band.
    #[serde(rename = "F")]
    Fiat,
}

/// A supported coin (e.g. BTC, LTC, USD).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoinSpec {
    /// Ticker symbol, also the storage key segment for this coin.
    pub name: String,
    /// Display symbol, e.g. `$`.
    #[serde(default)]
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: CoinKind,
    /// Minimum order size in base units.
    #[serde(default)]
    pub min_trade: u64,

    /// Average seconds between blocks.
    #[serde(default)]
    pub conf_sec: u32,
    /// Node RPC endpoint and credentials.
    #[serde(default)]
    pub rpc_host: String,
    #[serde(default)]
    pub rpc_user: String,
    #[serde(default)]
    pub rpc_pass: String,
    /// Blocks kept under active reorg consideration; `tot_conf >= req_conf`.
    #[serde(default)]
    pub tot_conf: u32,
    /// Confirmations required before a deposit is credited.
    #[serde(default)]
    pub req_conf: u32,
    /// Address version byte.
    #[serde(default)]
    pub addr_prefix: u8,
    /// WIF version byte.
    #[serde(default)]
    pub wif_prefix: u8,
    /// Base miner fee in base units.
    #[serde(default)]
    pub miner_fee: u64,
}

impl CoinSpec {
    /// Whether this coin has a chain synchronizer and treasury worker.
    pub fn is_crypto(&self) -> bool {
        self.kind == CoinKind::Crypto
    }

    /// Smallest withdrawal worth broadcasting.
    pub fn min_withdrawal(&self) -> u64 {
        self.miner_fee * 2
    }
}

/// A market pairing `coin` against the quote currency `basis_coin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSpec {
    pub coin: String,
    pub basis_coin: String,
}

impl MarketSpec {
    /// Canonical market name, `COIN/BASIS`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.coin, self.basis_coin)
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_app_name")]
    pub app_name: String,
    pub session_key: String,

    /// Hot master public key (hex-encoded compressed secp256k1 point).
    pub hot_mpk_pub_key: String,
    /// Hot master chain code (hex).
    pub hot_mpk_chain: String,

    /// Seconds between dispatched operator alerts.
    #[serde(default = "default_alert_interval")]
    pub alert_min_interval: i64,

    pub coins: Vec<CoinSpec>,
    #[serde(default)]
    pub markets: Vec<MarketSpec>,
}

fn default_app_name() -> String {
    "DEV".to_string()
}

fn default_alert_interval() -> i64 {
    600
}

impl Config {
    /// Parse and validate a configuration document.
    pub fn from_json(json: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read the configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let json = fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Io(path.as_ref().display().to_string(), e))?;
        Config::from_json(&json)
    }

    /// Look up a coin by symbol.
    pub fn coin(&self, name: &str) -> Result<&CoinSpec> {
        self.coins
            .iter()
            .find(|coin| coin.name == name)
            .ok_or_else(|| Error::UnknownCoin(name.to_string()))
    }

    /// All crypto coins, the ones that get chain and treasury workers.
    pub fn crypto_coins(&self) -> impl Iterator<Item = &CoinSpec> {
        self.coins.iter().filter(|coin| coin.is_crypto())
    }

    fn validate(&self) -> Result<()> {
        let required = |ok: bool, field: &str| {
            if ok {
                Ok(())
            } else {
                Err(Error::MissingField(field.to_string()))
            }
        };

        required(!self.session_key.is_empty(), "sessionKey")?;
        required(!self.hot_mpk_pub_key.is_empty(), "hotMpkPubKey")?;
        required(!self.hot_mpk_chain.is_empty(), "hotMpkChain")?;
        required(!self.coins.is_empty(), "coins")?;

        let mut seen = HashMap::new();
        for coin in &self.coins {
            if seen.insert(coin.name.clone(), ()).is_some() {
                return Err(Error::DuplicateCoin(coin.name.clone()));
            }
            if coin.is_crypto() {
                if coin.rpc_host.is_empty() {
                    return Err(Error::BadCoin(coin.name.clone(), "rpcHost must be set"));
                }
                if coin.req_conf == 0 {
                    return Err(Error::BadCoin(coin.name.clone(), "reqConf must be set"));
                }
                if coin.tot_conf < coin.req_conf {
                    return Err(Error::BadCoin(coin.name.clone(), "totConf must be >= reqConf"));
                }
                if coin.miner_fee == 0 {
                    return Err(Error::BadCoin(coin.name.clone(), "minerFee must be set"));
                }
            }
        }
        for market in &self.markets {
            self.coin(&market.coin)?;
            self.coin(&market.basis_coin)?;
        }
        Ok(())
    }
}

/// Write a default configuration document for the operator to edit.
pub fn write_default(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    log::info!("writing default configuration to {}", path.display());
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| Error::Io(path.display().to_string(), e))?;
    }
    let document = DEFAULT_CONFIG.replace("::SESSIONKEY::", &generate_session_key());
    fs::write(path, document).map_err(|e| Error::Io(path.display().to_string(), e))
}

fn generate_session_key() -> String {
    let mut rng = rand::thread_rng();
    (0..30).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

const DEFAULT_CONFIG: &str = r#"{
    "appName":          "DEV",
    "sessionKey":       "::SESSIONKEY::",

    "hotMpkPubKey":     "CHANGEME",
    "hotMpkChain":      "CHANGEME",

    "alertMinInterval": 600,

    "coins": [
        {
            "name":       "BTC",
            "type":       "C",
            "confSec":    600,
            "rpcUser":    "bitcoinrpc",
            "rpcPass":    "CHANGEME",
            "rpcHost":    "CHANGEME",
            "totConf":    6,
            "reqConf":    3,
            "addrPrefix": 0,
            "wifPrefix":  128,
            "minerFee":   20000,
            "minTrade":   40000
        },
        {
            "name":       "LTC",
            "type":       "C",
            "confSec":    250,
            "rpcUser":    "litecoinrpc",
            "rpcPass":    "CHANGEME",
            "rpcHost":    "CHANGEME",
            "totConf":    24,
            "reqConf":    12,
            "addrPrefix": 48,
            "wifPrefix":  176,
            "minerFee":   100000,
            "minTrade":   200000
        },
        {
            "name":       "USD",
            "symbol":     "$",
            "type":       "F",
            "minTrade":   1000000
        }
    ],

    "markets": [
        { "coin": "BTC", "basisCoin": "USD" },
        { "coin": "LTC", "basisCoin": "USD" }
    ]
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_document_parses_after_placeholder_substitution() {
        let json = DEFAULT_CONFIG.replace("::SESSIONKEY::", "abc123");
        let config = Config::from_json(&json).unwrap();
        assert_eq!(config.coins.len(), 3);
        assert_eq!(config.crypto_coins().count(), 2);
        assert_eq!(config.markets[0].name(), "BTC/USD");
        assert_eq!(config.coin("BTC").unwrap().req_conf, 3);
        assert!(config.coin("DOGE").is_err());
    }

    #[test]
    fn validation_rejects_inverted_confirmation_depths() {
        let json = DEFAULT_CONFIG
            .replace("::SESSIONKEY::", "abc123")
            .replace("\"totConf\":    6", "\"totConf\":    2");
        let err = Config::from_json(&json).unwrap_err();
        assert!(err.to_string().contains("totConf"));
    }
}
