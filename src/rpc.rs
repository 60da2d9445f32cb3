use crate::chain::{BlockHeader, ChainReader, HealthProbe, ProbeResult};
use crate::events::{
    Transfer, TransferLog, balanceOfCall, decode_transfer_logs, nameCall, ownerOfCall,
    symbolCall, tokenURICall, totalSupplyCall,
};
use crate::provider_manager::ProviderManager;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log, SyncStatus, TransactionRequest};
use alloy::sol_types::{SolCall, SolEvent};
use alloy_primitives::{Address, U256};
use anyhow::Result;
use regex::Regex;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

static SUGGESTED_RANGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"retry with the range (\d+)-(\d+)").ok());

/// One alloy HTTP provider per configured URL.
#[derive(Clone)]
pub struct Endpoints {
    providers: Arc<HashMap<String, DynProvider>>,
}

impl Endpoints {
    pub fn connect(rpc_urls: &[String]) -> Result<Self> {
        if rpc_urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let mut providers = HashMap::new();
        for url in rpc_urls {
            let parsed_url = url
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid RPC URL: {}", url))?;
            let provider = ProviderBuilder::new().connect_http(parsed_url).erased();
            providers.insert(url.clone(), provider);
        }

        Ok(Endpoints {
            providers: Arc::new(providers),
        })
    }

    fn get(&self, url: &str) -> Result<DynProvider> {
        self.providers
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No provider configured for {}", url))
    }
}

/// Chain reader that routes every request to the provider manager's current
/// healthy endpoint.
#[derive(Clone)]
pub struct RpcClient {
    endpoints: Endpoints,
    manager: Arc<ProviderManager>,
    request_timeout: Duration,
}

impl RpcClient {
    pub fn new(endpoints: Endpoints, manager: Arc<ProviderManager>) -> Self {
        RpcClient {
            endpoints,
            manager,
            request_timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Endpoint the next request goes to, as chosen by the provider manager.
    async fn select_endpoint(&self) -> Result<(String, DynProvider)> {
        let url = self.manager.get_healthy_provider().await;
        let provider = self.endpoints.get(&url)?;
        Ok((url, provider))
    }

    async fn request<T, E, F, Fut>(&self, method: &str, call: F) -> Result<T>
    where
        F: FnOnce(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let (url, provider) = self.select_endpoint().await?;

        match timeout(self.request_timeout, call(provider)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let error_str = e.to_string();
                if !error_str.contains("exceeds max results") {
                    warn!("RPC error on {} during {}: {}", url, method, error_str);
                }
                Err(anyhow::anyhow!("{}", error_str))
            }
            Err(_) => {
                warn!(
                    "Request timeout after {} seconds on {} during {}",
                    self.request_timeout.as_secs(),
                    url,
                    method
                );
                Err(anyhow::anyhow!(
                    "Request timeout after {} seconds",
                    self.request_timeout.as_secs()
                ))
            }
        }
    }

    pub async fn call_contract<C>(&self, address: Address, call: C) -> Result<C::Return>
    where
        C: SolCall + Send,
        C::Return: Send,
    {
        let tx = TransactionRequest::default()
            .to(address)
            .input(call.abi_encode().into());
        let output = self
            .request(C::SIGNATURE, |provider| async move { provider.call(tx).await })
            .await?;

        C::abi_decode_returns(&output)
            .map_err(|e| anyhow::anyhow!("Failed to decode {} result: {}", C::SIGNATURE, e))
    }

    async fn get_logs_internal(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
    ) -> Result<Vec<Log>> {
        let filter = Filter::new()
            .address(contract_address)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(from_block)
            .to_block(to_block);

        self.request("eth_getLogs", |provider| async move {
            provider.get_logs(&filter).await
        })
        .await
    }

    fn parse_max_results_error(error_str: &str) -> Option<(u64, u64)> {
        let captures = SUGGESTED_RANGE.as_ref()?.captures(error_str)?;

        let from = captures.get(1)?.as_str().parse().ok()?;
        let to = captures.get(2)?.as_str().parse().ok()?;

        Some((from, to))
    }

    /// Fetches logs for the whole range, following the endpoint's suggested
    /// sub-range whenever it rejects a query for returning too many results.
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        contract_address: Address,
    ) -> Result<Vec<Log>> {
        let mut all_logs = Vec::new();
        let mut current_from = from_block;

        while current_from <= to_block {
            match self
                .get_logs_internal(current_from, to_block, contract_address)
                .await
            {
                Ok(logs) => {
                    all_logs.extend(logs);
                    break;
                }
                Err(e) => {
                    let error_str = e.to_string();
                    let suggested = error_str
                        .contains("exceeds max results")
                        .then(|| Self::parse_max_results_error(&error_str))
                        .flatten();

                    let Some((suggested_from, suggested_to)) = suggested else {
                        return Err(e);
                    };
                    if suggested_to < current_from || suggested_to >= to_block {
                        return Err(e);
                    }

                    info!(
                        "Hit max results limit for blocks {}-{}, splitting at block {}",
                        current_from, to_block, suggested_to
                    );
                    let logs = self
                        .get_logs_internal(suggested_from, suggested_to, contract_address)
                        .await?;
                    all_logs.extend(logs);
                    current_from = suggested_to + 1;
                }
            }
        }

        Ok(all_logs)
    }
}

#[async_trait::async_trait]
impl ChainReader for RpcClient {
    async fn chain_id(&self) -> Result<u64> {
        self.request("eth_chainId", |provider| async move {
            provider.get_chain_id().await
        })
        .await
    }

    async fn block_number(&self) -> Result<u64> {
        self.request("eth_blockNumber", |provider| async move {
            provider.get_block_number().await
        })
        .await
    }

    async fn is_syncing(&self) -> Result<bool> {
        let status = self
            .request("eth_syncing", |provider| async move { provider.syncing().await })
            .await?;
        Ok(!matches!(status, SyncStatus::None))
    }

    async fn transfer_logs(
        &self,
        contract: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>> {
        let logs = self.get_logs(from_block, to_block, contract).await?;
        decode_transfer_logs(&logs)
    }

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>> {
        let block = self
            .request("eth_getBlockByNumber", |provider| async move {
                provider
                    .get_block_by_number(BlockNumberOrTag::Number(number))
                    .await
            })
            .await?;

        Ok(block.map(|block| BlockHeader {
            number: block.header.number,
            hash: block.header.hash,
            timestamp: block.header.timestamp,
        }))
    }

    async fn owner_of(&self, contract: Address, token_id: U256) -> Result<Address> {
        self.call_contract(contract, ownerOfCall { tokenId: token_id })
            .await
    }

    async fn token_uri(&self, contract: Address, token_id: U256) -> Result<String> {
        self.call_contract(contract, tokenURICall { tokenId: token_id })
            .await
    }

    async fn balance_of(&self, contract: Address, owner: Address) -> Result<U256> {
        self.call_contract(contract, balanceOfCall { owner }).await
    }

    async fn total_supply(&self, contract: Address) -> Result<U256> {
        self.call_contract(contract, totalSupplyCall {}).await
    }

    async fn name(&self, contract: Address) -> Result<String> {
        self.call_contract(contract, nameCall {}).await
    }

    async fn symbol(&self, contract: Address) -> Result<String> {
        self.call_contract(contract, symbolCall {}).await
    }
}

/// Health probe issuing `eth_chainId`, `eth_blockNumber` and `eth_syncing`
/// directly against one endpoint, bypassing provider selection.
#[derive(Clone)]
pub struct RpcProbe {
    endpoints: Endpoints,
}

impl RpcProbe {
    pub fn new(endpoints: Endpoints) -> Self {
        Self { endpoints }
    }
}

#[async_trait::async_trait]
impl HealthProbe for RpcProbe {
    async fn probe(&self, url: &str) -> Result<ProbeResult> {
        let provider = self.endpoints.get(url)?;

        let (chain_id, block_number, status) = tokio::try_join!(
            async { Ok::<_, anyhow::Error>(provider.get_chain_id().await?) },
            async { Ok::<_, anyhow::Error>(provider.get_block_number().await?) },
            async { Ok::<_, anyhow::Error>(provider.syncing().await?) },
        )?;

        Ok(ProbeResult {
            chain_id,
            block_number,
            syncing: !matches!(status, SyncStatus::None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;

    const PRIMARY: &str = "http://127.0.0.1:8545";
    const BACKUP: &str = "http://127.0.0.1:8546";

    /// Answers every URL except the ones currently marked down.
    #[derive(Default)]
    struct SwitchableProbe {
        down: std::sync::Mutex<Vec<String>>,
    }

    impl SwitchableProbe {
        fn set_down(&self, urls: &[&str]) {
            *self.down.lock().unwrap() = urls.iter().map(|u| u.to_string()).collect();
        }
    }

    #[async_trait::async_trait]
    impl HealthProbe for SwitchableProbe {
        async fn probe(&self, url: &str) -> Result<ProbeResult> {
            if self.down.lock().unwrap().iter().any(|d| d == url) {
                return Err(anyhow::anyhow!("connection refused"));
            }
            Ok(ProbeResult {
                chain_id: 1,
                block_number: 100,
                syncing: false,
            })
        }
    }

    #[tokio::test]
    async fn requests_follow_provider_failover() -> Result<()> {
        let urls = vec![PRIMARY.to_string(), BACKUP.to_string()];
        let probe = Arc::new(SwitchableProbe::default());
        let manager = Arc::new(ProviderManager::new(
            urls.clone(),
            1,
            HealthConfig {
                check_interval: Duration::from_millis(10),
                check_timeout: Duration::from_millis(100),
                failure_threshold: 3,
                success_threshold: 2,
            },
            probe.clone(),
        )?);
        let client = RpcClient::new(Endpoints::connect(&urls)?, manager.clone());
        assert_eq!(client.select_endpoint().await?.0, PRIMARY);

        probe.set_down(&[PRIMARY]);
        for _ in 0..2 {
            manager.check_all_providers().await;
            assert_eq!(client.select_endpoint().await?.0, PRIMARY);
        }
        manager.check_all_providers().await;
        assert_eq!(client.select_endpoint().await?.0, BACKUP);

        // the backup stays current once the primary recovers
        probe.set_down(&[]);
        for _ in 0..2 {
            manager.check_all_providers().await;
        }
        assert_eq!(client.select_endpoint().await?.0, BACKUP);

        probe.set_down(&[BACKUP]);
        for _ in 0..3 {
            manager.check_all_providers().await;
        }
        assert_eq!(client.select_endpoint().await?.0, PRIMARY);
        Ok(())
    }

    #[test]
    fn parses_suggested_range_from_max_results_error() {
        let error = "code: -32602 message: query exceeds max results 20000, retry with the range 23004221-23004288";
        assert_eq!(
            RpcClient::parse_max_results_error(error),
            Some((23004221, 23004288))
        );
        assert_eq!(RpcClient::parse_max_results_error("rate limited"), None);
    }

    #[test]
    fn rejects_invalid_urls() {
        assert!(Endpoints::connect(&["not a url".to_string()]).is_err());
        assert!(Endpoints::connect(&[]).is_err());
    }
}
