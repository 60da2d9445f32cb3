use crate::chain::ChainReader;
use crate::contract::ResilientContract;
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Width of the log window probed at each bisection step.
pub const PROBE_WINDOW: u64 = 100;

/// Locates the contract's first `Transfer` activity by bisecting
/// `[0, latest_block]` with windowed log queries instead of scanning from
/// genesis.
///
/// `latest_block` is a snapshot; blocks produced during the search are
/// picked up by the main loop.
pub async fn find_deployment_block(
    chain: &dyn ChainReader,
    address: Address,
    latest_block: u64,
) -> Result<u64> {
    info!("Searching for deployment block of contract {:?}", address);

    let mut left = 0u64;
    let mut right = latest_block;
    let mut probes = 0u32;

    while left < right {
        let mid = left + (right - left) / 2;
        let window_end = mid.saturating_add(PROBE_WINDOW).min(latest_block);

        let logs = chain
            .transfer_logs(address, mid, window_end)
            .await
            .with_context(|| format!("Failed to probe blocks {mid}-{window_end}"))?;
        probes += 1;

        if logs.is_empty() {
            left = mid + 1;
        } else {
            right = mid;
        }
    }

    info!(
        "Contract activity starts at block {} ({} probes)",
        left, probes
    );
    Ok(left)
}

#[derive(Debug, Clone)]
pub struct ContractMetadata {
    pub name: String,
    pub symbol: String,
    pub total_supply: U256,
}

/// Confirms the target answers the standard ERC-721 views. Any failure is
/// fatal.
pub async fn validate_contract(contract: &ResilientContract) -> Result<ContractMetadata> {
    info!("Validating contract {:?}", contract.address());

    let name = contract
        .try_name()
        .await
        .context("Contract did not respond to name()")?;
    let symbol = contract
        .try_symbol()
        .await
        .context("Contract did not respond to symbol()")?;
    let total_supply = contract
        .try_total_supply()
        .await
        .context("Contract did not respond to totalSupply()")?;

    info!(
        "Contract {} ({}) reports total supply {}",
        name, symbol, total_supply
    );
    Ok(ContractMetadata {
        name,
        symbol,
        total_supply,
    })
}

/// Fails unless the connected chain is the expected network; a syncing node
/// only earns a warning.
pub async fn validate_connection(chain: &dyn ChainReader, expected_chain_id: u64) -> Result<()> {
    let chain_id = chain
        .chain_id()
        .await
        .context("Failed to fetch chain id")?;
    if chain_id != expected_chain_id {
        anyhow::bail!(
            "Connected to chain {} but expected chain {}",
            chain_id,
            expected_chain_id
        );
    }

    match chain.is_syncing().await {
        Ok(true) => warn!("RPC node reports it is still syncing; head data may lag"),
        Ok(false) => {}
        Err(e) => warn!("Failed to query sync status: {}", e),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ALICE, BOB, CONTRACT, MockChain, executor};

    #[tokio::test]
    async fn bisection_lands_at_or_before_first_event() -> Result<()> {
        let chain = MockChain::new(1_000_000);
        chain.transfer(654_321, 1, Address::ZERO, ALICE);
        // steady activity after the mint keeps every later window non-empty
        for block in (654_400..1_000_000).step_by(50) {
            chain.transfer(block, 1, ALICE, BOB);
        }

        let found = find_deployment_block(chain.as_ref(), CONTRACT, 1_000_000).await?;
        assert!(found <= 654_321);
        assert!(found + PROBE_WINDOW >= 654_321);
        assert!(chain.log_queries().len() <= 21);
        Ok(())
    }

    #[tokio::test]
    async fn no_activity_converges_on_head() -> Result<()> {
        let chain = MockChain::new(5_000);
        let found = find_deployment_block(chain.as_ref(), CONTRACT, 5_000).await?;
        assert_eq!(found, 5_000);
        Ok(())
    }

    #[tokio::test]
    async fn wrong_chain_is_fatal() {
        let chain = MockChain::new(10);
        let err = validate_connection(chain.as_ref(), 56).await.unwrap_err();
        assert!(err.to_string().contains("expected chain 56"));
    }

    #[tokio::test]
    async fn syncing_node_is_not_fatal() -> Result<()> {
        let chain = MockChain::new(10);
        chain.set_syncing(true);
        validate_connection(chain.as_ref(), chain.chain_id()).await?;

        let contract = ResilientContract::new(chain, executor(), CONTRACT);
        let metadata = validate_contract(&contract).await?;
        assert_eq!(metadata.symbol, "MOCK");
        Ok(())
    }
}
