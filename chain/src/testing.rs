//! A deterministic in-process chain simulator implementing [`ChainRpc`].
//!
//! Drives the synchronizer and treasury test suites without a node
//! daemon: blocks are pushed and reorganized explicitly, signing produces
//! a synthetic-but-valid hex encoding whose size behaves like a real
//! transaction, and broadcasts are recorded for inspection.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use ferrox_protected::Protected;

use crate::rpc::{ChainRpc, RpcBlock, RpcError, RpcPayment, RpcResult};

struct SimBlock {
    height: u32,
    hash: String,
    time: i64,
    payments: Vec<RpcPayment>,
}

#[derive(Default)]
struct SimState {
    blocks: Vec<SimBlock>,
    mempool: Vec<RpcPayment>,
    broadcasts: Vec<String>,
    hash_nonce: u64,
}

/// Simulated chain for one coin.
pub struct SimChain {
    coin: String,
    base_height: u32,
    state: Mutex<SimState>,
}

/// Build an unconfirmed [`RpcPayment`] paying `address`.
pub fn sim_payment(coin: &str, tx_id: &str, vout: u32, address: &str, amount: u64) -> RpcPayment {
    RpcPayment {
        coin: coin.to_string(),
        tx_id: tx_id.to_string(),
        vout,
        blockhash: None,
        blockheight: None,
        address: address.to_string(),
        amount,
        script_pk: format!("76a914{}88ac", hex::encode(address.as_bytes())),
        time: 0,
    }
}

impl SimChain {
    /// New simulator whose first pushed block lands at `base_height`.
    pub fn new(coin: &str, base_height: u32) -> Self {
        SimChain {
            coin: coin.to_string(),
            base_height,
            state: Mutex::new(SimState::default()),
        }
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim state lock")
    }

    fn stamp(coin: &str, block_height: u32, hash: &str, time: i64, payments: &[RpcPayment]) -> Vec<RpcPayment> {
        payments
            .iter()
            .map(|payment| RpcPayment {
                coin: coin.to_string(),
                blockhash: Some(hash.to_string()),
                blockheight: Some(block_height),
                time,
                ..payment.clone()
            })
            .collect()
    }

    /// Append a block containing `payments` to the tip. Returns its header.
    pub fn push_block(&self, payments: Vec<RpcPayment>) -> RpcBlock {
        let mut state = self.locked();
        let height = self.base_height + state.blocks.len() as u32;
        state.hash_nonce += 1;
        let hash = format!("blk{:06}n{:06}", height, state.hash_nonce);
        let time = 600 * i64::from(height);
        let payments = Self::stamp(&self.coin, height, &hash, time, &payments);
        // Anything that just confirmed leaves the simulated mempool.
        let confirmed: Vec<String> = payments.iter().map(|p| p.tx_id.clone()).collect();
        state.mempool.retain(|p| !confirmed.contains(&p.tx_id));
        state.blocks.push(SimBlock {
            height,
            hash: hash.clone(),
            time,
            payments,
        });
        RpcBlock {
            coin: self.coin.clone(),
            height,
            hash,
            time,
        }
    }

    /// Reorganize: replace the block at `height` with one carrying
    /// `payments`, regenerate every block above it (empty), and keep the
    /// tip height unchanged.
    pub fn reorg(&self, height: u32, payments: Vec<RpcPayment>) {
        let old_tip = {
            let mut state = self.locked();
            let tip = self.base_height + state.blocks.len() as u32 - 1;
            assert!(height >= self.base_height && height <= tip, "reorg height out of range");
            state.blocks.truncate((height - self.base_height) as usize);
            tip
        };
        self.push_block(payments);
        for _ in height..old_tip {
            self.push_block(Vec::new());
        }
    }

    /// Add an unconfirmed payment to the simulated mempool.
    pub fn add_mempool_payment(&self, payment: RpcPayment) {
        self.locked().mempool.push(payment);
    }

    /// Raw transactions broadcast so far.
    pub fn broadcasts(&self) -> Vec<String> {
        self.locked().broadcasts.clone()
    }
}

#[async_trait]
impl ChainRpc for SimChain {
    async fn tip_height(&self, _coin: &str) -> RpcResult<u32> {
        let state = self.locked();
        if state.blocks.is_empty() {
            return Ok(self.base_height.saturating_sub(1));
        }
        Ok(self.base_height + state.blocks.len() as u32 - 1)
    }

    async fn block_at(&self, _coin: &str, height: u32) -> RpcResult<Option<RpcBlock>> {
        let state = self.locked();
        if height < self.base_height {
            return Err(RpcError::Protocol(format!("height {height} is pruned")));
        }
        Ok(state
            .blocks
            .get((height - self.base_height) as usize)
            .map(|block| RpcBlock {
                coin: self.coin.clone(),
                height: block.height,
                hash: block.hash.clone(),
                time: block.time,
            }))
    }

    async fn blocks_between(&self, coin: &str, lo: u32, hi: u32) -> RpcResult<Vec<RpcBlock>> {
        let mut headers = Vec::new();
        for height in lo..=hi {
            let header = self.block_at(coin, height).await?.ok_or_else(|| {
                RpcError::Protocol(format!("no block at height {height}"))
            })?;
            headers.push(header);
        }
        Ok(headers)
    }

    async fn time_for_block(&self, _coin: &str, hash: &str) -> RpcResult<i64> {
        let state = self.locked();
        state
            .blocks
            .iter()
            .find(|block| block.hash == hash)
            .map(|block| block.time)
            .ok_or_else(|| RpcError::Protocol(format!("unknown block {hash}")))
    }

    async fn payments_for_block(&self, _coin: &str, hash: &str) -> RpcResult<Vec<RpcPayment>> {
        let state = self.locked();
        state
            .blocks
            .iter()
            .find(|block| block.hash == hash)
            .map(|block| block.payments.clone())
            .ok_or_else(|| RpcError::Protocol(format!("unknown block {hash}")))
    }

    async fn payments_for_tx(&self, _coin: &str, tx_id: &str) -> RpcResult<Vec<RpcPayment>> {
        let state = self.locked();
        let found: Vec<RpcPayment> = state
            .mempool
            .iter()
            .filter(|payment| payment.tx_id == tx_id)
            .cloned()
            .collect();
        if found.is_empty() {
            return Err(RpcError::TxUnavailable(tx_id.to_string()));
        }
        Ok(found)
    }

    async fn mempool_tx_ids(&self, _coin: &str) -> RpcResult<Vec<String>> {
        let state = self.locked();
        let mut ids: Vec<String> = state.mempool.iter().map(|p| p.tx_id.clone()).collect();
        ids.dedup();
        Ok(ids)
    }

    async fn create_signed_raw_transaction(
        &self,
        coin: &str,
        inputs: &[RpcPayment],
        outputs: &BTreeMap<String, u64>,
        priv_keys: &[Protected],
    ) -> RpcResult<String> {
        if priv_keys.len() < inputs.len() {
            return Err(RpcError::Protocol("missing signing keys".to_string()));
        }
        // Deterministic stand-in with a realistic size profile: ~180
        // bytes per input, ~34 per output, like a real P2PKH transaction.
        let mut description = format!("{coin}:");
        for input in inputs {
            description.push_str(&format!("{}:{};", input.tx_id, input.vout));
            description.push_str(&"00".repeat(74));
        }
        for (address, amount) in outputs {
            description.push_str(&format!("{address}={amount};"));
        }
        Ok(hex::encode(description))
    }

    async fn send_raw_transaction(&self, _coin: &str, raw_hex: &str) -> RpcResult<()> {
        self.locked().broadcasts.push(raw_hex.to_string());
        Ok(())
    }
}
