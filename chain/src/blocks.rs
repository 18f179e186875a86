//! Block store. The hash is the row key; a separate height index covers
//! only non-orphaned blocks, so height lookups and last-N scans never see
//! stale forks.

use ferrox_storage::Tx;

use crate::model::{Block, BlockStatus};
use crate::{keys, Error, Result};

pub fn load_block(tx: &mut Tx, hash: &str) -> Result<Option<Block>> {
    Ok(tx.get_opt(keys::block(hash))?)
}

/// The non-orphaned block at a height, if any.
pub fn load_block_at_height(tx: &mut Tx, coin: &str, height: u32) -> Result<Option<Block>> {
    let hash: Option<String> = tx.get_opt(keys::block_at_height(coin, height))?;
    match hash {
        Some(hash) => load_block(tx, &hash),
        None => Ok(None),
    }
}

/// The newest `n` non-orphaned blocks, descending by height.
pub fn last_blocks(tx: &mut Tx, coin: &str, n: usize) -> Result<Vec<Block>> {
    let hashes: Vec<(Vec<u8>, String)> =
        tx.scan_prefix(keys::block_height_prefix(coin), true, Some(n))?;
    hashes
        .into_iter()
        .map(|(_, hash)| {
            load_block(tx, &hash)?.ok_or(Error::NotFound {
                entity: "block",
                key: hash,
            })
        })
        .collect()
}

/// Insert a new block row.
pub fn save_block(tx: &mut Tx, block: &Block) -> Result<()> {
    tx.put(keys::block(&block.hash), block)?;
    if block.status != BlockStatus::Orphaned {
        tx.put(keys::block_at_height(&block.coin, block.height), &block.hash)?;
    }
    Ok(())
}

/// Guarded status transition: asserts the block currently is in
/// `old`, then moves it to `new` and maintains the height index.
pub fn update_block_status(
    tx: &mut Tx,
    hash: &str,
    old: BlockStatus,
    new: BlockStatus,
) -> Result<Block> {
    let mut block = load_block(tx, hash)?.ok_or(Error::NotFound {
        entity: "block",
        key: hash.to_string(),
    })?;
    if block.status != old {
        return Err(Error::UnexpectedBlockStatus {
            hash: hash.to_string(),
            expected: old,
            actual: block.status,
        });
    }
    block.status = new;
    block.updated = ferrox_util::now();
    tx.put(keys::block(hash), &block)?;
    if new == BlockStatus::Orphaned {
        tx.delete(keys::block_at_height(&block.coin, block.height));
    } else {
        tx.put(keys::block_at_height(&block.coin, block.height), &block.hash)?;
    }
    Ok(block)
}
