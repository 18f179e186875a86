//! Thin JSON-RPC adapter from [`ChainRpc`] to a bitcoind-style node
//! daemon. Only the calls the synchronizer and treasury need; anything
//! structural beyond that belongs in the engines, not here.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use ferrox_chain::rpc::{ChainRpc, RpcBlock, RpcError, RpcPayment, RpcResult};
use ferrox_config::CoinSpec;
use ferrox_protected::Protected;

/// Error code bitcoind returns for transactions it cannot look up.
const RPC_TX_UNAVAILABLE: i64 = -5;

pub struct NodeRpc {
    coin: String,
    url: String,
    user: String,
    pass: String,
    client: reqwest::Client,
}

impl NodeRpc {
    pub fn new(spec: &CoinSpec) -> NodeRpc {
        let url = if spec.rpc_host.starts_with("http") {
            spec.rpc_host.clone()
        } else {
            format!("http://{}", spec.rpc_host)
        };
        NodeRpc {
            coin: spec.name.clone(),
            url,
            user: spec.rpc_user.clone(),
            pass: spec.rpc_pass.clone(),
            client: reqwest::Client::new(),
        }
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> RpcResult<Value> {
        log::debug!("[{}] rpc {method}", self.coin);
        let body = json!({
            "jsonrpc": "1.0",
            "id": "ferrox",
            "method": method,
            "params": params,
        });
        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let reply: Value = response
            .json()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let error = &reply["error"];
        if !error.is_null() {
            if error["code"].as_i64() == Some(RPC_TX_UNAVAILABLE) {
                return Err(RpcError::TxUnavailable(error.to_string()));
            }
            return Err(RpcError::Protocol(error.to_string()));
        }
        Ok(reply["result"].clone())
    }

    fn str_field(value: &Value, field: &str) -> RpcResult<String> {
        value[field]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol(format!("missing field {field}")))
    }

    /// Outputs of one decoded transaction; coinbase outputs are skipped
    /// entirely (they need deeper confirmation handling).
    fn payments_from_tx(&self, tx: &Value) -> Vec<RpcPayment> {
        if tx["vin"][0]["coinbase"].is_string() {
            return Vec::new();
        }
        let tx_id = match tx["txid"].as_str() {
            Some(tx_id) => tx_id.to_string(),
            None => return Vec::new(),
        };
        let time = tx["time"].as_i64().unwrap_or(0);

        let mut payments = Vec::new();
        for (vout, output) in tx["vout"].as_array().into_iter().flatten().enumerate() {
            let script = &output["scriptPubKey"];
            let kind = script["type"].as_str().unwrap_or_default();
            if kind != "pubkey" && kind != "pubkeyhash" {
                continue;
            }
            let Some(address) = script["addresses"][0].as_str() else {
                continue;
            };
            let Some(value) = output["value"].as_f64() else {
                continue;
            };
            payments.push(RpcPayment {
                coin: self.coin.clone(),
                tx_id: tx_id.clone(),
                vout: vout as u32,
                blockhash: None,
                blockheight: None,
                address: address.to_string(),
                amount: ferrox_util::math::coins_to_units(value) as u64,
                script_pk: script["hex"].as_str().unwrap_or_default().to_string(),
                time,
            });
        }
        payments
    }
}

#[async_trait]
impl ChainRpc for NodeRpc {
    async fn tip_height(&self, _coin: &str) -> RpcResult<u32> {
        let height = self.call("getblockcount", vec![]).await?;
        height
            .as_u64()
            .map(|h| h as u32)
            .ok_or_else(|| RpcError::Protocol("getblockcount returned no number".into()))
    }

    async fn block_at(&self, coin: &str, height: u32) -> RpcResult<Option<RpcBlock>> {
        if height > self.tip_height(coin).await? {
            return Ok(None);
        }
        let hash = self.call("getblockhash", vec![json!(height)]).await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| RpcError::Protocol("getblockhash returned no hash".into()))?;
        Ok(Some(RpcBlock {
            coin: self.coin.clone(),
            height,
            hash: hash.to_string(),
            time: 0,
        }))
    }

    async fn blocks_between(&self, coin: &str, lo: u32, hi: u32) -> RpcResult<Vec<RpcBlock>> {
        let mut blocks = Vec::with_capacity((hi.saturating_sub(lo) + 1) as usize);
        for height in lo..=hi {
            let block = self
                .block_at(coin, height)
                .await?
                .ok_or_else(|| RpcError::Protocol(format!("no block at height {height}")))?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    async fn time_for_block(&self, _coin: &str, hash: &str) -> RpcResult<i64> {
        let block = self.call("getblock", vec![json!(hash)]).await?;
        block["time"]
            .as_i64()
            .ok_or_else(|| RpcError::Protocol("getblock returned no time".into()))
    }

    async fn payments_for_block(&self, _coin: &str, hash: &str) -> RpcResult<Vec<RpcPayment>> {
        let block = self.call("getblock", vec![json!(hash)]).await?;
        let height = block["height"]
            .as_u64()
            .ok_or_else(|| RpcError::Protocol("getblock returned no height".into()))?
            as u32;

        let mut payments = Vec::new();
        for tx_id in block["tx"].as_array().into_iter().flatten() {
            let Some(tx_id) = tx_id.as_str() else {
                continue;
            };
            let tx = match self
                .call("getrawtransaction", vec![json!(tx_id), json!(1)])
                .await
            {
                Ok(tx) => tx,
                // Spent and not indexed by this node; skip.
                Err(RpcError::TxUnavailable(_)) => continue,
                Err(e) => return Err(e),
            };
            for mut payment in self.payments_from_tx(&tx) {
                payment.blockhash = Some(hash.to_string());
                payment.blockheight = Some(height);
                payments.push(payment);
            }
        }
        Ok(payments)
    }

    async fn payments_for_tx(&self, _coin: &str, tx_id: &str) -> RpcResult<Vec<RpcPayment>> {
        let tx = self
            .call("getrawtransaction", vec![json!(tx_id), json!(1)])
            .await?;
        Ok(self.payments_from_tx(&tx))
    }

    async fn mempool_tx_ids(&self, _coin: &str) -> RpcResult<Vec<String>> {
        let ids = self.call("getrawmempool", vec![]).await?;
        Ok(ids
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|id| id.as_str().map(str::to_string))
            .collect())
    }

    async fn create_signed_raw_transaction(
        &self,
        _coin: &str,
        inputs: &[RpcPayment],
        outputs: &BTreeMap<String, u64>,
        priv_keys: &[Protected],
    ) -> RpcResult<String> {
        let raw_inputs: Vec<Value> = inputs
            .iter()
            .map(|input| json!({ "txid": input.tx_id, "vout": input.vout }))
            .collect();
        let raw_outputs: Value = outputs
            .iter()
            .map(|(address, amount)| {
                (
                    address.clone(),
                    json!(ferrox_util::math::units_to_coins(*amount as i64)),
                )
            })
            .collect::<serde_json::Map<String, Value>>()
            .into();
        let raw = self
            .call("createrawtransaction", vec![json!(raw_inputs), raw_outputs])
            .await?;

        let prev_outputs: Vec<Value> = inputs
            .iter()
            .map(|input| {
                json!({
                    "txid": input.tx_id,
                    "vout": input.vout,
                    "scriptPubKey": input.script_pk,
                })
            })
            .collect();
        let keys: Vec<Value> = priv_keys
            .iter()
            .map(|key| json!(String::from_utf8_lossy(key.as_bytes())))
            .collect();
        let signed = self
            .call(
                "signrawtransaction",
                vec![raw, json!(prev_outputs), json!(keys)],
            )
            .await?;
        if signed["complete"].as_bool() != Some(true) {
            return Err(RpcError::Protocol("failed to sign transaction".into()));
        }
        Self::str_field(&signed, "hex")
    }

    async fn send_raw_transaction(&self, _coin: &str, raw_hex: &str) -> RpcResult<()> {
        log::info!("[{}] broadcasting raw transaction", self.coin);
        self.call("sendrawtransaction", vec![json!(raw_hex)]).await?;
        Ok(())
    }
}
