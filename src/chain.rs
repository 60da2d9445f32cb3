use crate::events::TransferLog;
use alloy_primitives::{Address, B256, U256};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub timestamp: u64,
}

/// The read-only chain surface the sync engine depends on.
#[async_trait::async_trait]
pub trait ChainReader: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;

    async fn block_number(&self) -> Result<u64>;

    async fn is_syncing(&self) -> Result<bool>;

    /// `Transfer` logs emitted by `contract` in `[from_block, to_block]`, in
    /// ascending (block, log index) order.
    async fn transfer_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>>;

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>>;

    async fn owner_of(&self, contract: Address, token_id: U256) -> Result<Address>;

    async fn token_uri(&self, contract: Address, token_id: U256) -> Result<String>;

    async fn balance_of(&self, contract: Address, owner: Address) -> Result<U256>;

    async fn total_supply(&self, contract: Address) -> Result<U256>;

    async fn name(&self, contract: Address) -> Result<String>;

    async fn symbol(&self, contract: Address) -> Result<String>;
}

/// Raw outcome of a single endpoint health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub chain_id: u64,
    pub block_number: u64,
    pub syncing: bool,
}

#[async_trait::async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<ProbeResult>;
}
