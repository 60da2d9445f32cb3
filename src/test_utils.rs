use crate::chain::{BlockHeader, ChainReader};
use crate::config::BreakerConfig;
use crate::events::TransferLog;
use crate::resilience::{CircuitBreaker, ResilienceExecutor};
use alloy_primitives::{Address, B256, U256, address};
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CONTRACT: Address = address!("0x00000000000000000000000000000000000000c1");
pub const ALICE: Address = address!("0x000000000000000000000000000000000000000a");
pub const BOB: Address = address!("0x000000000000000000000000000000000000000b");
pub const CAROL: Address = address!("0x000000000000000000000000000000000000000c");

const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

#[derive(Default)]
struct ChainData {
    head: u64,
    syncing: bool,
    /// Bumped per block on every simulated reorg so hashes change.
    forks: HashMap<u64, u64>,
    logs: Vec<TransferLog>,
    failing_owner_of: HashSet<U256>,
    failing_token_uri: HashSet<U256>,
    owner_overrides: HashMap<U256, Address>,
    failing_log_queries: usize,
    log_queries: Vec<(u64, u64)>,
    total_supply: Option<U256>,
}

impl ChainData {
    fn block_hash(&self, number: u64) -> B256 {
        let fork = self.forks.get(&number).copied().unwrap_or_default();
        let mut bytes = [0u8; 32];
        bytes[16..24].copy_from_slice(&fork.to_be_bytes());
        bytes[24..].copy_from_slice(&number.to_be_bytes());
        B256::from(bytes)
    }

    fn next_log_index(&self, block: u64) -> u64 {
        self.logs.iter().filter(|l| l.block_number == block).count() as u64
    }
}

/// In-memory ERC-721 chain: blocks are implicit, logs are explicit.
pub struct MockChain {
    chain_id: u64,
    data: Mutex<ChainData>,
}

impl MockChain {
    pub fn new(head: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id: 1,
            data: Mutex::new(ChainData {
                head,
                ..Default::default()
            }),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn set_head(&self, head: u64) {
        self.data.lock().unwrap().head = head;
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.data.lock().unwrap().syncing = syncing;
    }

    pub fn transfer(&self, block: u64, token_id: u64, from: Address, to: Address) {
        let mut data = self.data.lock().unwrap();
        let log_index = data.next_log_index(block);
        let fork = data.forks.get(&block).copied().unwrap_or_default();
        let log = TransferLog {
            contract_address: CONTRACT,
            token_id: U256::from(token_id),
            from,
            to,
            block_number: block,
            block_hash: data.block_hash(block),
            block_timestamp: None,
            transaction_hash: B256::from(U256::from(block * 1_000_000 + fork * 1_000 + log_index)),
            transaction_index: log_index,
            log_index,
        };
        data.logs.push(log);
    }

    /// Replaces the contents of `block` with a new fork.
    pub fn reorg_block(&self, block: u64) {
        let mut data = self.data.lock().unwrap();
        data.logs.retain(|l| l.block_number != block);
        *data.forks.entry(block).or_default() += 1;
    }

    pub fn fail_owner_of(&self, token_id: u64) {
        self.data
            .lock()
            .unwrap()
            .failing_owner_of
            .insert(U256::from(token_id));
    }

    pub fn fail_token_uri(&self, token_id: u64) {
        self.data
            .lock()
            .unwrap()
            .failing_token_uri
            .insert(U256::from(token_id));
    }

    pub fn override_owner(&self, token_id: u64, owner: Address) {
        self.data
            .lock()
            .unwrap()
            .owner_overrides
            .insert(U256::from(token_id), owner);
    }

    pub fn fail_next_log_queries(&self, count: usize) {
        self.data.lock().unwrap().failing_log_queries = count;
    }

    pub fn set_total_supply(&self, supply: u64) {
        self.data.lock().unwrap().total_supply = Some(U256::from(supply));
    }

    pub fn log_queries(&self) -> Vec<(u64, u64)> {
        self.data.lock().unwrap().log_queries.clone()
    }

    pub fn block_hash(&self, number: u64) -> B256 {
        self.data.lock().unwrap().block_hash(number)
    }
}

#[async_trait::async_trait]
impl ChainReader for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.data.lock().unwrap().head)
    }

    async fn is_syncing(&self) -> Result<bool> {
        Ok(self.data.lock().unwrap().syncing)
    }

    async fn transfer_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>> {
        let mut data = self.data.lock().unwrap();
        data.log_queries.push((from_block, to_block));
        if data.failing_log_queries > 0 {
            data.failing_log_queries -= 1;
            anyhow::bail!("429 Too Many Requests");
        }

        let mut logs: Vec<TransferLog> = data
            .logs
            .iter()
            .filter(|l| {
                l.contract_address == contract
                    && l.block_number >= from_block
                    && l.block_number <= to_block
            })
            .cloned()
            .collect();
        logs.sort_by_key(|l| (l.block_number, l.log_index));
        Ok(logs)
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>> {
        let data = self.data.lock().unwrap();
        if number > data.head {
            return Ok(None);
        }
        Ok(Some(BlockHeader {
            number,
            hash: data.block_hash(number),
            timestamp: GENESIS_TIMESTAMP + number * 12,
        }))
    }

    async fn owner_of(&self, _contract: Address, token_id: U256) -> Result<Address> {
        let data = self.data.lock().unwrap();
        if data.failing_owner_of.contains(&token_id) {
            anyhow::bail!("execution reverted: ownerOf({token_id})");
        }
        if let Some(owner) = data.owner_overrides.get(&token_id) {
            return Ok(*owner);
        }
        data.logs
            .iter()
            .filter(|l| l.token_id == token_id)
            .max_by_key(|l| (l.block_number, l.log_index))
            .map(|l| l.to)
            .ok_or_else(|| anyhow::anyhow!("execution reverted: nonexistent token"))
    }

    async fn token_uri(&self, _contract: Address, token_id: U256) -> Result<String> {
        let data = self.data.lock().unwrap();
        if data.failing_token_uri.contains(&token_id) {
            anyhow::bail!("execution reverted: tokenURI({token_id})");
        }
        Ok(format!("ipfs://collection/{token_id}"))
    }

    async fn balance_of(&self, _contract: Address, owner: Address) -> Result<U256> {
        let data = self.data.lock().unwrap();
        let mut latest: HashMap<U256, (u64, u64, Address)> = HashMap::new();
        for log in &data.logs {
            let entry = latest.entry(log.token_id).or_insert((0, 0, Address::ZERO));
            if (log.block_number, log.log_index) >= (entry.0, entry.1) {
                *entry = (log.block_number, log.log_index, log.to);
            }
        }
        Ok(U256::from(latest.values().filter(|(_, _, to)| *to == owner).count()))
    }

    async fn total_supply(&self, _contract: Address) -> Result<U256> {
        let data = self.data.lock().unwrap();
        if let Some(supply) = data.total_supply {
            return Ok(supply);
        }
        let minted: HashSet<U256> = data.logs.iter().map(|l| l.token_id).collect();
        Ok(U256::from(minted.len()))
    }

    async fn name(&self, _contract: Address) -> Result<String> {
        Ok("Mock Collection".to_string())
    }

    async fn symbol(&self, _contract: Address) -> Result<String> {
        Ok("MOCK".to_string())
    }
}

pub fn executor() -> ResilienceExecutor {
    let breaker = CircuitBreaker::new(
        "test-rpc",
        BreakerConfig {
            failure_threshold: 50,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
        },
    );
    ResilienceExecutor::new(Arc::new(breaker), Duration::from_secs(5))
}
