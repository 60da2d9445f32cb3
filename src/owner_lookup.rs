use crate::contract::ResilientContract;
use crate::repository::{Database, TokenRepository};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchOwnerResult {
    pub owners: BTreeMap<U256, Address>,
    pub failed_token_ids: Vec<U256>,
}

impl BatchOwnerResult {
    pub fn success_count(&self) -> usize {
        self.owners.len()
    }
}

/// Looks up live owners with at most `concurrency` calls in flight. Every
/// lookup settles on its own; a failure only lands its id in
/// `failed_token_ids`.
pub async fn batch_owner_lookup(
    contract: &ResilientContract,
    token_ids: &[U256],
    concurrency: usize,
) -> BatchOwnerResult {
    let settled: Vec<_> = stream::iter(token_ids.iter().copied())
        .map(|token_id| async move { (token_id, contract.try_owner_of(token_id).await) })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut result = BatchOwnerResult::default();
    for (token_id, outcome) in settled {
        match outcome {
            Ok(owner) => {
                result.owners.insert(token_id, owner);
            }
            Err(e) => {
                warn!("Owner lookup failed for token {}: {}", token_id, e);
                result.failed_token_ids.push(token_id);
            }
        }
    }
    result.failed_token_ids.sort();
    result
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RefreshOutcome {
    pub refreshed: usize,
    pub changed: usize,
    pub failed: usize,
    pub failed_token_ids: Vec<U256>,
}

/// Re-reads owners from chain and writes back only the successful lookups;
/// tokens whose lookup failed keep their stored owner.
pub async fn refresh_owners(
    contract: &ResilientContract,
    db: &Database,
    token_ids: &[U256],
    concurrency: usize,
    synced_block: u64,
) -> Result<RefreshOutcome> {
    let lookup = batch_owner_lookup(contract, token_ids, concurrency).await;
    let address = contract.address();

    let changed = db.transaction(|conn| {
        let repo = TokenRepository::new(conn);
        let stored: BTreeMap<U256, Option<Address>> =
            repo.owners_of(&address, token_ids)?.into_iter().collect();

        let mut changed = 0;
        for (token_id, owner) in &lookup.owners {
            let Some(previous) = stored.get(token_id) else {
                continue;
            };
            if previous.as_ref() != Some(owner) {
                changed += 1;
            }
            repo.update_owner(&address, token_id, owner, synced_block)?;
        }
        Ok(changed)
    })?;

    let outcome = RefreshOutcome {
        refreshed: lookup.success_count(),
        changed,
        failed: lookup.failed_token_ids.len(),
        failed_token_ids: lookup.failed_token_ids,
    };
    info!(
        "Owner refresh: {} refreshed, {} changed, {} failed",
        outcome.refreshed, outcome.changed, outcome.failed
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::TransferEvent;
    use crate::test_utils::{ALICE, BOB, CONTRACT, MockChain, executor};
    use chrono::Utc;

    #[tokio::test]
    async fn one_failing_token_never_aborts_the_batch() {
        let chain = MockChain::new(1_000);
        for id in 1..=100u64 {
            chain.transfer(100 + id, id, Address::ZERO, ALICE);
        }
        chain.fail_owner_of(57);
        let contract = ResilientContract::new(chain, executor(), CONTRACT);

        let ids: Vec<U256> = (1..=100u64).map(U256::from).collect();
        let result = batch_owner_lookup(&contract, &ids, 8).await;

        assert_eq!(result.success_count(), 99);
        assert_eq!(result.failed_token_ids, vec![U256::from(57)]);
        assert!(!result.owners.contains_key(&U256::from(57)));
        assert!(result.owners.values().all(|owner| *owner == ALICE));
    }

    #[tokio::test]
    async fn refresh_writes_successes_and_leaves_failures_untouched() -> Result<()> {
        let chain = MockChain::new(1_000);
        let db = Database::in_memory()?;
        for id in 1..=3u64 {
            chain.transfer(100, id, Address::ZERO, ALICE);
        }
        let logs =
            crate::chain::ChainReader::transfer_logs(chain.as_ref(), CONTRACT, 0, 1_000).await?;
        db.with_conn(|conn| {
            let repo = TokenRepository::new(conn);
            for log in &logs {
                repo.upsert_from_transfer(&TransferEvent::from_log(log, Utc::now()), Utc::now())?;
            }
            Ok(())
        })?;

        chain.override_owner(1, BOB);
        chain.override_owner(3, BOB);
        chain.fail_owner_of(3);
        let contract = ResilientContract::new(chain, executor(), CONTRACT);

        let ids: Vec<U256> = (1..=3u64).map(U256::from).collect();
        let outcome = refresh_owners(&contract, &db, &ids, 4, 500).await?;
        assert_eq!((outcome.refreshed, outcome.changed, outcome.failed), (2, 1, 1));

        let owners = db.with_conn(|conn| TokenRepository::new(conn).owners_of(&CONTRACT, &ids))?;
        assert_eq!(
            owners,
            vec![
                (U256::from(1), Some(BOB)),
                (U256::from(2), Some(ALICE)),
                (U256::from(3), Some(ALICE)),
            ]
        );
        Ok(())
    }
}
