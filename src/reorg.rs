use crate::chain::ChainReader;
use crate::repository::{
    Database, SyncState, SyncStateRepository, TokenFilter, TokenRepository, TransferRepository,
};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    fn single(block: u64) -> Self {
        Self {
            start: block,
            end: block,
        }
    }

    fn widen(self, block: u64) -> Self {
        Self {
            start: self.start.min(block),
            end: self.end.max(block),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReorgReport {
    pub range: BlockRange,
    pub transfers_removed: usize,
    pub tokens_restored: usize,
    pub tokens_unsynced: usize,
    pub rewound_from: u64,
    pub rewound_to: u64,
}

/// Blocks re-verified after each batch: up to `depth` blocks strictly below
/// the finalized watermark, never before the sync start.
pub fn check_window(state: &SyncState, depth: u64) -> Option<BlockRange> {
    if state.finalized_to_block == 0 {
        return None;
    }
    let end = state.finalized_to_block - 1;
    let start = state
        .finalized_to_block
        .saturating_sub(depth)
        .max(state.start_block);
    (start <= end).then_some(BlockRange { start, end })
}

/// Compares the block hashes recorded with stored transfers against the live
/// chain. Returns the span of mismatched blocks, if any. A block the node no
/// longer returns counts as a mismatch.
pub async fn detect_reorg(
    chain: &dyn ChainReader,
    db: &Database,
    contract: Address,
    window: BlockRange,
) -> Result<Option<BlockRange>> {
    let stored = db.with_conn(|conn| {
        TransferRepository::new(conn).block_hashes_in_range(&contract, window.start, window.end)
    })?;

    let mut mismatched: Option<BlockRange> = None;
    for (number, stored_hash) in stored {
        let live = chain
            .block_header(number)
            .await
            .with_context(|| format!("Failed to fetch block {number} for reorg check"))?;

        if live.is_some_and(|header| header.hash == stored_hash) {
            continue;
        }

        warn!(
            "Block {} hash changed: stored {:?}, live {:?}",
            number,
            stored_hash,
            live.map(|header| header.hash)
        );
        mismatched = Some(match mismatched {
            Some(range) => range.widen(number),
            None => BlockRange::single(number),
        });
    }

    Ok(mismatched)
}

/// Undoes everything indexed from `range.start` onward in one transaction
/// and rewinds the checkpoint so the range is replayed.
///
/// Every transfer at or after the start is removed, including descendants of
/// the orphaned blocks. Touched tokens fall back to their latest surviving
/// transfer; tokens with none are kept but marked unsynced (no owner,
/// `last_synced_block` just before the range).
pub fn rollback(db: &Database, state: &mut SyncState, range: BlockRange) -> Result<ReorgReport> {
    let contract = state.contract_address;
    let mut next = state.clone();

    let report = db.transaction(|conn| {
        let transfers = TransferRepository::new(conn);
        let tokens = TokenRepository::new(conn);

        let touched = transfers.token_ids_from_block(&contract, range.start)?;
        let transfers_removed = transfers.delete_from_block(&contract, range.start)?;

        let mut tokens_restored = 0;
        let mut tokens_unsynced = 0;
        for token_id in &touched {
            match transfers.latest_before(&contract, token_id, range.start)? {
                Some(prior) => {
                    tokens.restore_from_transfer(&prior)?;
                    tokens_restored += 1;
                }
                None => {
                    tokens.mark_unsynced(&contract, token_id, range.start.saturating_sub(1))?;
                    tokens_unsynced += 1;
                }
            }
        }

        let rewound_from = next.current_block;
        next.current_block = next.current_block.min(range.start);
        next.finalized_to_block = next.current_block.saturating_sub(next.confirmations);
        next.transfers_count = transfers.count(&contract)?;
        next.tokens_discovered = tokens.count(&contract, &[TokenFilter::Synced])?;
        next.tokens_enriched =
            tokens.count(&contract, &[TokenFilter::Synced, TokenFilter::Enriched])?;
        next.completed_at = None;
        next.updated_at = Utc::now();
        SyncStateRepository::new(conn).save(&next)?;

        Ok(ReorgReport {
            range,
            transfers_removed,
            tokens_restored,
            tokens_unsynced,
            rewound_from,
            rewound_to: next.current_block,
        })
    })?;

    info!(
        "Rolled back reorg at blocks {}-{}: {} transfers removed, {} tokens restored, {} unsynced; resuming from block {}",
        range.start,
        range.end,
        report.transfers_removed,
        report.tokens_restored,
        report.tokens_unsynced,
        report.rewound_to
    );

    *state = next;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::TransferEvent;
    use crate::test_utils::{ALICE, BOB, CAROL, CONTRACT, MockChain};
    use alloy_primitives::U256;

    async fn index_all(chain: &MockChain, db: &Database) -> Result<()> {
        let logs = chain.transfer_logs(CONTRACT, 0, 1_000).await?;
        let now = Utc::now();
        db.transaction(|conn| {
            let transfers: Vec<TransferEvent> =
                logs.iter().map(|log| TransferEvent::from_log(log, now)).collect();
            TransferRepository::new(conn).insert_batch(&transfers)?;
            let tokens = TokenRepository::new(conn);
            for transfer in &transfers {
                tokens.upsert_from_transfer(transfer, now)?;
            }
            Ok(())
        })
    }

    fn owner(db: &Database, token_id: u64) -> Result<Option<Address>> {
        db.with_conn(|conn| {
            let token = TokenRepository::new(conn)
                .get(&CONTRACT, &U256::from(token_id))?
                .context("token row missing")?;
            Ok(token.owner_address)
        })
    }

    #[test]
    fn window_trails_the_finalized_watermark() {
        let mut state = SyncState::new(CONTRACT, 100, 500, 3, 10);
        assert_eq!(check_window(&state, 100), None);

        state.current_block = 111;
        state.recompute_finalized();
        assert_eq!(
            check_window(&state, 100),
            Some(BlockRange { start: 100, end: 107 })
        );

        state.current_block = 400;
        state.recompute_finalized();
        assert_eq!(
            check_window(&state, 100),
            Some(BlockRange { start: 297, end: 396 })
        );
    }

    #[tokio::test]
    async fn detects_the_span_of_changed_blocks() -> Result<()> {
        let chain = MockChain::new(200);
        let db = Database::in_memory()?;
        for block in [100, 103, 106, 109] {
            chain.transfer(block, block, Address::ZERO, ALICE);
        }
        index_all(&chain, &db).await?;

        let window = BlockRange { start: 100, end: 150 };
        assert_eq!(detect_reorg(chain.as_ref(), &db, CONTRACT, window).await?, None);

        chain.reorg_block(103);
        chain.reorg_block(106);
        assert_eq!(
            detect_reorg(chain.as_ref(), &db, CONTRACT, window).await?,
            Some(BlockRange { start: 103, end: 106 })
        );

        // a stored block above the node's head no longer exists
        chain.set_head(105);
        assert_eq!(
            detect_reorg(chain.as_ref(), &db, CONTRACT, window).await?,
            Some(BlockRange { start: 103, end: 109 })
        );
        Ok(())
    }

    #[tokio::test]
    async fn rollback_restores_prior_owners_and_rewinds() -> Result<()> {
        let chain = MockChain::new(200);
        let db = Database::in_memory()?;
        chain.transfer(100, 1, Address::ZERO, ALICE);
        chain.transfer(101, 2, Address::ZERO, CAROL);
        chain.transfer(105, 1, ALICE, BOB);
        chain.transfer(105, 3, Address::ZERO, BOB);
        chain.transfer(108, 1, BOB, CAROL);
        index_all(&chain, &db).await?;
        db.with_conn(|conn| {
            let tokens = TokenRepository::new(conn);
            tokens.set_token_uri(&CONTRACT, &U256::from(1), "ipfs://1")?;
            tokens.set_token_uri(&CONTRACT, &U256::from(3), "ipfs://3")
        })?;

        let mut state = SyncState::new(CONTRACT, 100, 200, 3, 10);
        state.current_block = 111;
        state.recompute_finalized();
        state.transfers_count = 5;
        state.tokens_discovered = 3;
        state.tokens_enriched = 2;

        let report = rollback(&db, &mut state, BlockRange { start: 105, end: 105 })?;
        assert_eq!(report.transfers_removed, 3);
        assert_eq!((report.tokens_restored, report.tokens_unsynced), (1, 1));
        assert_eq!((report.rewound_from, report.rewound_to), (111, 105));

        // restored to the last surviving transfer, untouched token unchanged
        assert_eq!(owner(&db, 1)?, Some(ALICE));
        assert_eq!(owner(&db, 2)?, Some(CAROL));
        assert_eq!(owner(&db, 3)?, None);

        let unsynced =
            db.with_conn(|conn| TokenRepository::new(conn).get(&CONTRACT, &U256::from(3)))?;
        assert_eq!(unsynced.map(|t| t.last_synced_block), Some(104));

        assert_eq!(state.current_block, 105);
        assert_eq!(state.finalized_to_block, 102);
        assert_eq!(state.transfers_count, 2);
        assert_eq!((state.tokens_discovered, state.tokens_enriched), (2, 1));

        let persisted = db.with_conn(|conn| SyncStateRepository::new(conn).get(&CONTRACT))?;
        assert_eq!(persisted.map(|s| s.current_block), Some(105));
        Ok(())
    }
}
