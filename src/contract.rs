use crate::chain::ChainReader;
use crate::resilience::{ResilienceError, ResilienceExecutor};
use alloy_primitives::{Address, U256};
use std::sync::Arc;

/// ERC-721 view calls against one contract, each routed through the shared
/// resilience executor.
///
/// The plain methods degrade to a safe default (zero address, zero balance,
/// empty string, `None`). The `try_` variants surface the failure instead,
/// for callers that must tell a real answer from a fallback.
#[derive(Clone)]
pub struct ResilientContract {
    chain: Arc<dyn ChainReader>,
    executor: ResilienceExecutor,
    address: Address,
}

impl ResilientContract {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        executor: ResilienceExecutor,
        address: Address,
    ) -> Self {
        Self {
            chain,
            executor,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn executor(&self) -> &ResilienceExecutor {
        &self.executor
    }

    pub async fn try_owner_of(&self, token_id: U256) -> Result<Address, ResilienceError> {
        self.executor
            .execute(&format!("ownerOf({token_id})"), || {
                self.chain.owner_of(self.address, token_id)
            })
            .await
    }

    pub async fn owner_of(&self, token_id: U256) -> Address {
        self.executor
            .execute_with_fallback(
                &format!("ownerOf({token_id})"),
                || self.chain.owner_of(self.address, token_id),
                Address::ZERO,
            )
            .await
    }

    pub async fn try_token_uri(&self, token_id: U256) -> Result<String, ResilienceError> {
        self.executor
            .execute(&format!("tokenURI({token_id})"), || {
                self.chain.token_uri(self.address, token_id)
            })
            .await
    }

    pub async fn token_uri(&self, token_id: U256) -> Option<String> {
        self.try_token_uri(token_id).await.ok()
    }

    pub async fn balance_of(&self, owner: Address) -> U256 {
        self.executor
            .execute_with_fallback(
                "balanceOf",
                || self.chain.balance_of(self.address, owner),
                U256::ZERO,
            )
            .await
    }

    pub async fn try_total_supply(&self) -> Result<U256, ResilienceError> {
        self.executor
            .execute("totalSupply", || self.chain.total_supply(self.address))
            .await
    }

    pub async fn total_supply(&self) -> U256 {
        self.executor
            .execute_with_fallback(
                "totalSupply",
                || self.chain.total_supply(self.address),
                U256::ZERO,
            )
            .await
    }

    pub async fn try_name(&self) -> Result<String, ResilienceError> {
        self.executor
            .execute("name", || self.chain.name(self.address))
            .await
    }

    pub async fn try_symbol(&self) -> Result<String, ResilienceError> {
        self.executor
            .execute("symbol", || self.chain.symbol(self.address))
            .await
    }

    pub async fn name(&self) -> String {
        self.executor
            .execute_with_fallback("name", || self.chain.name(self.address), String::new())
            .await
    }

    pub async fn symbol(&self) -> String {
        self.executor
            .execute_with_fallback("symbol", || self.chain.symbol(self.address), String::new())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ALICE, BOB, CONTRACT, MockChain, executor};

    #[tokio::test]
    async fn reads_degrade_to_safe_defaults() {
        let chain = MockChain::new(200);
        chain.transfer(100, 1, Address::ZERO, ALICE);
        chain.transfer(101, 2, Address::ZERO, ALICE);
        chain.fail_owner_of(2);
        chain.fail_token_uri(1);
        let contract = ResilientContract::new(chain, executor(), CONTRACT);

        assert_eq!(contract.owner_of(U256::from(1)).await, ALICE);
        assert_eq!(contract.owner_of(U256::from(2)).await, Address::ZERO);
        assert!(contract.try_owner_of(U256::from(2)).await.is_err());
        assert_eq!(contract.token_uri(U256::from(1)).await, None);
        assert_eq!(
            contract.token_uri(U256::from(2)).await.as_deref(),
            Some("ipfs://collection/2")
        );
        assert_eq!(contract.balance_of(ALICE).await, U256::from(2));
        assert_eq!(contract.balance_of(BOB).await, U256::ZERO);
        assert_eq!(contract.total_supply().await, U256::from(2));
        assert_eq!(contract.symbol().await, "MOCK");
    }
}
