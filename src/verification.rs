use crate::contract::ResilientContract;
use crate::repository::{Database, Token, TokenFilter, TokenRepository};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub token_id: U256,
    pub stored_owner: Option<Address>,
    pub chain_owner: Address,
    pub stored_uri: Option<String>,
    pub chain_uri: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub sample_size: usize,
    pub matches: usize,
    pub mismatches: Vec<Mismatch>,
    /// Sampled tokens whose live read failed; they count against accuracy.
    pub errors: usize,
    pub accuracy: f64,
    pub accuracy_threshold: f64,
    /// Live (owned, not burned) tokens in the store.
    pub total_tokens: u64,
    pub expected_total: Option<u64>,
    pub total_matches: bool,
    pub passed: bool,
}

enum Outcome {
    Match,
    Mismatch(Mismatch),
    Error,
}

async fn check_token(contract: &ResilientContract, token: Token) -> Outcome {
    let chain_owner = match contract.try_owner_of(token.token_id).await {
        Ok(owner) => owner,
        Err(e) => {
            warn!("Verification read of token {} failed: {}", token.token_id, e);
            return Outcome::Error;
        }
    };

    // only compare URIs the store actually captured
    let chain_uri = match &token.token_uri {
        Some(_) => match contract.try_token_uri(token.token_id).await {
            Ok(uri) => Some(uri),
            Err(e) => {
                warn!("Verification read of token {} URI failed: {}", token.token_id, e);
                return Outcome::Error;
            }
        },
        None => None,
    };

    let owner_matches = token.owner_address == Some(chain_owner);
    let uri_matches = chain_uri.is_none() || chain_uri == token.token_uri;
    if owner_matches && uri_matches {
        return Outcome::Match;
    }

    Outcome::Mismatch(Mismatch {
        token_id: token.token_id,
        stored_owner: token.owner_address,
        chain_owner,
        stored_uri: token.token_uri,
        chain_uri,
    })
}

/// Re-reads a random sample of stored tokens from chain and compares owners
/// and URIs, then checks the store's live token count against
/// `totalSupply()`.
pub async fn verify_sample(
    contract: &ResilientContract,
    db: &Database,
    sample_size: usize,
    concurrency: usize,
    accuracy_threshold: f64,
) -> Result<VerificationReport> {
    let address = contract.address();
    let (sample, total_tokens) = db.with_conn(|conn| {
        let repo = TokenRepository::new(conn);
        let sample = repo.sample(&address, sample_size)?;
        let all = repo.count(&address, &[])?;
        let unsynced = repo.count(&address, &[TokenFilter::Unsynced])?;
        let burned = repo.count(&address, &[TokenFilter::Owner(Address::ZERO)])?;
        Ok((sample, all.saturating_sub(unsynced + burned)))
    })?;

    info!(
        "Verifying {} sampled tokens of {:?} against chain",
        sample.len(),
        address
    );

    let sampled = sample.len();
    let outcomes: Vec<Outcome> = stream::iter(sample)
        .map(|token| check_token(contract, token))
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut matches = 0;
    let mut errors = 0;
    let mut mismatches = Vec::new();
    for outcome in outcomes {
        match outcome {
            Outcome::Match => matches += 1,
            Outcome::Mismatch(mismatch) => mismatches.push(mismatch),
            Outcome::Error => errors += 1,
        }
    }
    mismatches.sort_by_key(|m| m.token_id);

    let accuracy = if sampled == 0 {
        1.0
    } else {
        matches as f64 / sampled as f64
    };

    let expected_total = match contract.try_total_supply().await {
        Ok(supply) => Some(supply.saturating_to::<u64>()),
        Err(e) => {
            warn!("totalSupply() unavailable, skipping count check: {}", e);
            None
        }
    };
    let total_matches = expected_total.is_none_or(|expected| expected == total_tokens);

    let report = VerificationReport {
        sample_size: sampled,
        matches,
        mismatches,
        errors,
        accuracy,
        accuracy_threshold,
        total_tokens,
        expected_total,
        total_matches,
        passed: accuracy >= accuracy_threshold && total_matches,
    };

    if report.passed {
        info!(
            "Verification passed: {}/{} matched, {} tokens indexed",
            report.matches, report.sample_size, report.total_tokens
        );
    } else {
        warn!(
            "Verification failed: accuracy {:.2}% (threshold {:.2}%), {} mismatches, {} errors, totals {} vs {:?}",
            report.accuracy * 100.0,
            accuracy_threshold * 100.0,
            report.mismatches.len(),
            report.errors,
            report.total_tokens,
            report.expected_total
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::TransferEvent;
    use crate::test_utils::{ALICE, BOB, CONTRACT, MockChain, executor};
    use chrono::Utc;

    async fn seeded(tokens: u64) -> Result<(std::sync::Arc<MockChain>, Database)> {
        let chain = MockChain::new(1_000);
        let db = Database::in_memory()?;
        for id in 1..=tokens {
            chain.transfer(100 + id, id, Address::ZERO, ALICE);
        }
        let logs =
            crate::chain::ChainReader::transfer_logs(chain.as_ref(), CONTRACT, 0, 1_000).await?;
        db.transaction(|conn| {
            let repo = TokenRepository::new(conn);
            for log in &logs {
                repo.upsert_from_transfer(&TransferEvent::from_log(log, Utc::now()), Utc::now())?;
                let uri = format!("ipfs://collection/{}", log.token_id);
                repo.set_token_uri(&CONTRACT, &log.token_id, &uri)?;
            }
            Ok(())
        })?;
        Ok((chain, db))
    }

    #[tokio::test]
    async fn faithful_store_passes() -> Result<()> {
        let (chain, db) = seeded(20).await?;
        let contract = ResilientContract::new(chain, executor(), CONTRACT);

        let report = verify_sample(&contract, &db, 50, 4, 0.99).await?;
        assert_eq!(report.sample_size, 20);
        assert_eq!(report.matches, 20);
        assert_eq!(report.accuracy, 1.0);
        assert_eq!(report.expected_total, Some(20));
        assert!(report.passed);
        Ok(())
    }

    #[tokio::test]
    async fn drift_and_count_gaps_fail_the_report() -> Result<()> {
        let (chain, db) = seeded(10).await?;
        chain.override_owner(4, BOB);
        chain.fail_owner_of(7);
        chain.set_total_supply(11);
        let contract = ResilientContract::new(chain, executor(), CONTRACT);

        let report = verify_sample(&contract, &db, 10, 4, 0.5).await?;
        assert_eq!((report.matches, report.errors), (8, 1));
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].token_id, U256::from(4));
        assert_eq!(report.mismatches[0].chain_owner, BOB);
        assert!(report.accuracy >= 0.5);
        assert!(!report.total_matches);
        assert!(!report.passed);
        Ok(())
    }
}
