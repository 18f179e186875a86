//! The per-coin chain synchronizer.
//!
//! One long-running worker per crypto coin, and the only writer of block
//! and payment rows for that coin. Every pass re-derives what to do from
//! persisted state, so crashing anywhere and re-entering the loop is
//! always safe:
//!
//! 1. Compare the last `tot_conf` local blocks against the node; any hash
//!    mismatch marks local blocks orphaned.
//! 2. If anything is orphaned, unwind exactly the newest orphaned block.
//! 3. Otherwise finish any block stuck in `Processing`.
//! 4. Otherwise ingest the next height, crediting deposits of the block
//!    that just reached confirmation depth first.
//! 5. With no new block, diff the mempool and sleep.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ferrox_config::CoinSpec;
use ferrox_ledger as ledger;
use ferrox_storage::Store;
use ferrox_util::Alerter;

use crate::model::{Block, BlockStatus, OrphanStatus, Payment};
use crate::rpc::{ChainRpc, RpcBlock, RpcError, RpcPayment};
use crate::{blocks, payments, registry, Error, Result};

/// Sleep between idle passes and after errors.
const TICK: Duration = Duration::from_secs(30);

pub struct ChainSync {
    coin: CoinSpec,
    store: Store,
    rpc: Arc<dyn ChainRpc>,
    alerter: Arc<Alerter>,
    /// Unconfirmed txids already ingested; cleared when the height moves.
    mempool_seen: HashSet<String>,
}

impl ChainSync {
    pub fn new(
        coin: CoinSpec,
        store: Store,
        rpc: Arc<dyn ChainRpc>,
        alerter: Arc<Alerter>,
    ) -> Self {
        ChainSync {
            coin,
            store,
            rpc,
            alerter,
            mempool_seen: HashSet::new(),
        }
    }

    /// Worker entry point. Never returns; unexpected errors become
    /// operator alerts and the loop re-enters after a pause.
    pub async fn run(mut self) {
        log::info!("[{}] chain synchronizer started", self.coin.name);
        loop {
            match self.iterate().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(TICK).await,
                Err(e) => {
                    self.alerter
                        .alert(&format!("[{}] chain sync error: {e}", self.coin.name));
                    tokio::time::sleep(TICK).await;
                }
            }
        }
    }

    /// One pass. `Ok(true)` means progress was made and the next pass
    /// should run immediately; `Ok(false)` means the tip is reached.
    pub async fn iterate(&mut self) -> Result<bool> {
        let (orphaned, good) = self.assess_last_blocks().await?;

        // Unwind one orphaned block per pass, newest first.
        if let Some(block) = orphaned.first() {
            self.orphan_block(block)?;
            return Ok(true);
        }

        // Finish a block interrupted mid-processing.
        if let Some(first) = good.first() {
            if first.status == BlockStatus::Processing {
                for block in &good[1..] {
                    if block.status != BlockStatus::Good
                        && block.status != BlockStatus::GoodCredited
                    {
                        return Err(Error::Invariant(format!(
                            "block {} below a processing block is {:?}",
                            block.hash, block.status
                        )));
                    }
                }
                self.process_block(first).await?;
                return Ok(true);
            }
        }

        let next_height = match good.first() {
            Some(newest) => newest.height + 1,
            None => self.rpc.tip_height(&self.coin.name).await?,
        };
        match self.rpc.block_at(&self.coin.name, next_height).await? {
            Some(next) => {
                // The block at depth `req_conf` just became fully
                // confirmed; credit its deposits before ingesting the tip.
                if next_height + 1 > self.coin.req_conf {
                    self.credit_deposits_at_height(next_height + 1 - self.coin.req_conf)?;
                }
                let block = self.create_or_unorphan_block(&next).await?;
                self.process_block(&block).await?;
                Ok(true)
            }
            None => {
                self.sync_mempool(next_height).await?;
                Ok(false)
            }
        }
    }

    /// Split the last `tot_conf` local blocks into (orphaned, still-good)
    /// by comparing hashes against the node, both newest first. The split
    /// reflects the node's view, not the stored statuses.
    async fn assess_last_blocks(&self) -> Result<(Vec<Block>, Vec<Block>)> {
        let local = self.store.view(|tx| {
            blocks::last_blocks(tx, &self.coin.name, self.coin.tot_conf as usize)
        })?;
        if local.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let newest = local[0].height;
        let oldest = local[local.len() - 1].height;
        let actual = self
            .rpc
            .blocks_between(&self.coin.name, oldest, newest)
            .await?;
        let hashes: HashMap<u32, String> =
            actual.into_iter().map(|b| (b.height, b.hash)).collect();

        let mut orphaned = Vec::new();
        let mut good = Vec::new();
        for (i, block) in local.iter().enumerate() {
            let actual_hash = hashes.get(&block.height).ok_or_else(|| {
                Error::Invariant(format!(
                    "node returned no hash for tracked height {}",
                    block.height
                ))
            })?;
            if *actual_hash == block.hash {
                good = local[i..].to_vec();
                break;
            }
            orphaned.push(block.clone());
        }
        Ok((orphaned, good))
    }

    /// Create the block row in `Processing`, or return an orphaned
    /// existing row to the main chain.
    async fn create_or_unorphan_block(&self, rpc_block: &RpcBlock) -> Result<Block> {
        let existing = self
            .store
            .view(|tx| blocks::load_block(tx, &rpc_block.hash))?;
        match existing {
            None => {
                let mut block = Block::from_rpc(rpc_block, BlockStatus::Processing);
                if block.time == 0 {
                    block.time = self
                        .rpc
                        .time_for_block(&self.coin.name, &rpc_block.hash)
                        .await?;
                }
                self.store.serializable(|tx| blocks::save_block(tx, &block))?;
                Ok(block)
            }
            Some(existing) => {
                if existing.status != BlockStatus::Orphaned {
                    return Err(Error::Invariant(format!(
                        "block {} re-observed on the main chain is {:?}, expected orphaned",
                        existing.hash, existing.status
                    )));
                }
                self.store.serializable(|tx| {
                    blocks::update_block_status(
                        tx,
                        &rpc_block.hash,
                        BlockStatus::Orphaned,
                        BlockStatus::Processing,
                    )
                })
            }
        }
    }

    /// Save (or unorphan) the payments of a processing block and create
    /// their pending deposits, then mark the block good. Credits nothing.
    async fn process_block(&self, block: &Block) -> Result<()> {
        let current = self
            .store
            .view(|tx| blocks::load_block(tx, &block.hash))?
            .ok_or_else(|| {
                Error::Invariant(format!("processing block {} has no row", block.hash))
            })?;
        if current.status != BlockStatus::Processing {
            return Err(Error::Invariant(format!(
                "process_block wants a processing block, {} is {:?}",
                block.hash, current.status
            )));
        }

        let rpc_payments = self
            .rpc
            .payments_for_block(&self.coin.name, &block.hash)
            .await?;
        self.ingest_payments(rpc_payments, Some(block))?;

        self.store.serializable(|tx| {
            blocks::update_block_status(
                tx,
                &block.hash,
                BlockStatus::Processing,
                BlockStatus::Good,
            )
            .map(|_| ())
        })
    }

    /// Filter node payments to known addresses, then upsert each payment
    /// and its pending deposit. `block` is absent for mempool payments.
    fn ingest_payments(&self, rpc_payments: Vec<RpcPayment>, block: Option<&Block>) -> Result<()> {
        let recognized = self
            .store
            .view(|tx| registry::recognized_payments(tx, rpc_payments))?;
        if recognized.is_empty() {
            return Ok(());
        }
        log::info!(
            "[{}] ingesting {} recognized payments{}",
            self.coin.name,
            recognized.len(),
            block.map(|b| format!(" from block {}", b.hash)).unwrap_or_default()
        );
        for (rpc_payment, address) in recognized {
            match block {
                None => {
                    if rpc_payment.blockhash.is_some() || rpc_payment.blockheight.is_some() {
                        return Err(Error::Invariant(
                            "mempool payment carries a block reference".to_string(),
                        ));
                    }
                }
                Some(block) => {
                    if rpc_payment.blockhash.as_deref() != Some(block.hash.as_str())
                        || rpc_payment.blockheight != Some(block.height)
                    {
                        return Err(Error::Invariant(format!(
                            "payment {}:{} does not reference block {}",
                            rpc_payment.tx_id, rpc_payment.vout, block.hash
                        )));
                    }
                }
            }
            self.store.serializable(|tx| {
                let payment = payments::upsert_payment(tx, &rpc_payment, address.mpk_id)?;
                ledger::create_deposit_for_payment(
                    tx,
                    address.user_id,
                    &address.wallet,
                    &address.coin,
                    payment.amount,
                    payment.id,
                )?;
                Ok::<_, Error>(())
            })?;
        }
        Ok(())
    }

    /// Credit the deposits of the good block at `height`, then mark it
    /// credited. Skips blocks already credited; both levels (block and
    /// deposit) are idempotent.
    fn credit_deposits_at_height(&self, height: u32) -> Result<()> {
        let block = self
            .store
            .view(|tx| blocks::load_block_at_height(tx, &self.coin.name, height))?;
        let Some(block) = block else {
            return Ok(());
        };
        if block.status == BlockStatus::GoodCredited {
            return Ok(());
        }
        if block.status != BlockStatus::Good {
            return Err(Error::Invariant(format!(
                "crediting block at height {height} but it is {:?}",
                block.status
            )));
        }

        let block_payments = self
            .store
            .view(|tx| payments::payments_by_blockhash(tx, &block.hash))?;
        for payment in &block_payments {
            self.credit_deposit_for_payment(payment)?;
        }

        self.store.serializable(|tx| {
            blocks::update_block_status(
                tx,
                &block.hash,
                BlockStatus::Good,
                BlockStatus::GoodCredited,
            )
            .map(|_| ())
        })
    }

    fn credit_deposit_for_payment(&self, payment: &Payment) -> Result<()> {
        self.store.serializable(|tx| {
            let current = payments::load_payment_by_outpoint(tx, &payment.tx_id, payment.vout)?
                .ok_or_else(|| {
                    Error::Invariant(format!("payment {}:{} vanished", payment.tx_id, payment.vout))
                })?;
            if current.orphaned != OrphanStatus::Good {
                return Err(Error::Invariant(
                    "cannot credit a deposit for an orphaned payment".to_string(),
                ));
            }
            if current.id != payment.id {
                return Err(Error::Invariant("payment id changed under credit".to_string()));
            }
            let deposit = ledger::deposit_for_payment(tx, current.id)?.ok_or_else(|| {
                Error::Invariant(format!("payment {} has no deposit", current.id))
            })?;
            ledger::credit_deposit(tx, deposit.id)?;
            Ok::<_, Error>(())
        })
    }

    /// Unwind a block the node no longer has on the main chain: orphan its
    /// payments, uncredit their deposits, mark the block orphaned.
    fn orphan_block(&self, block: &Block) -> Result<()> {
        log::warn!(
            "[{}] orphaning block {} at height {}",
            self.coin.name,
            block.hash,
            block.height
        );
        let current = self
            .store
            .view(|tx| blocks::load_block(tx, &block.hash))?
            .ok_or_else(|| {
                Error::Invariant(format!("cannot orphan missing block {}", block.hash))
            })?;
        match current.status {
            BlockStatus::Processing => {}
            BlockStatus::Good | BlockStatus::GoodCredited => {
                self.store.serializable(|tx| {
                    blocks::update_block_status(
                        tx,
                        &block.hash,
                        current.status,
                        BlockStatus::Processing,
                    )
                    .map(|_| ())
                })?;
            }
            BlockStatus::Orphaned => {
                return Err(Error::Invariant(format!(
                    "block {} is already orphaned",
                    block.hash
                )));
            }
        }

        let block_payments = self
            .store
            .view(|tx| payments::payments_by_blockhash(tx, &block.hash))?;
        for payment in block_payments {
            self.orphan_payment(payment)?;
        }

        self.store.serializable(|tx| {
            blocks::update_block_status(
                tx,
                &block.hash,
                BlockStatus::Processing,
                BlockStatus::Orphaned,
            )
            .map(|_| ())
        })
    }

    fn orphan_payment(&self, payment: Payment) -> Result<()> {
        let payment = self.store.serializable(|tx| {
            payments::set_payment_orphaned(tx, payment.id, OrphanStatus::Orphaned)
        })?;

        let balance = self.store.serializable(|tx| {
            let current = payments::load_payment_by_outpoint(tx, &payment.tx_id, payment.vout)?
                .ok_or_else(|| {
                    Error::Invariant(format!("payment {}:{} vanished", payment.tx_id, payment.vout))
                })?;
            if current.orphaned != OrphanStatus::Orphaned {
                return Err(Error::Invariant(
                    "cannot uncredit a deposit for a non-orphaned payment".to_string(),
                ));
            }
            match ledger::deposit_for_payment(tx, current.id)? {
                Some(deposit) => ledger::uncredit_deposit(tx, deposit.id).map_err(Error::from),
                None => Ok(None),
            }
        })?;

        // The operation commits even when the user already spent the
        // funds; recovery of a negative balance is an operator concern.
        if let Some(balance) = balance {
            if balance.amount < 0 {
                self.alerter.alert(&format!(
                    "[{}] user {} {} balance went negative ({}) on reorg",
                    self.coin.name, balance.user_id, balance.wallet, balance.amount
                ));
            }
        }
        Ok(())
    }

    /// Ingest unconfirmed payments for txids not seen before. The seen-set
    /// is cleared once the chain advances past the expected height.
    async fn sync_mempool(&mut self, next_height: u32) -> Result<()> {
        let tip = self.rpc.tip_height(&self.coin.name).await?;
        if next_height <= tip {
            self.mempool_seen.clear();
            return Ok(());
        }

        let tx_ids = self.rpc.mempool_tx_ids(&self.coin.name).await?;
        let mut fresh = Vec::new();
        for tx_id in tx_ids {
            if self.mempool_seen.insert(tx_id.clone()) {
                fresh.push(tx_id);
            }
        }
        if fresh.is_empty() {
            return Ok(());
        }
        log::debug!(
            "[{}] {} new unconfirmed transactions",
            self.coin.name,
            fresh.len()
        );

        let mut rpc_payments = Vec::new();
        for tx_id in fresh {
            match self.rpc.payments_for_tx(&self.coin.name, &tx_id).await {
                Ok(found) => rpc_payments.extend(found),
                // Spent and not indexed; nothing to ingest.
                Err(RpcError::TxUnavailable(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.ingest_payments(rpc_payments, None)
    }
}
