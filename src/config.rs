use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub backup_rpc_urls: Vec<String>,
    pub contract_address: Address,
    pub database_url: String,
    pub chain_id: u64,
    pub sync: SyncConfig,
    pub health: HealthConfig,
    pub breaker: BreakerConfig,
    pub rpc_timeout: Duration,
    pub owner_lookup_concurrency: usize,
    pub verify_accuracy_threshold: f64,
}

/// Tuning knobs for the chain-sync loop.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub start_block: Option<u64>,
    pub confirmations: u64,
    pub batch_size: u64,
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub rate_limit_delay: Duration,
    pub reorg_check_depth: u64,
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            start_block: None,
            confirmations: 20,
            batch_size: 1000,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            rate_limit_delay: Duration::from_millis(100),
            reorg_check_depth: 100,
            poll_interval: Duration::from_secs(12),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub check_timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            check_timeout: Duration::from_secs(5),
            failure_threshold: 3,
            success_threshold: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let rpc_url = std::env::var("RPC_URL").context("RPC_URL must be set in .env")?;

        let backup_rpc_urls = std::env::var("BACKUP_RPC_URLS")
            .map(|raw| split_urls(&raw))
            .unwrap_or_default();

        let contract_address_str =
            std::env::var("CONTRACT_ADDRESS").context("CONTRACT_ADDRESS must be set in .env")?;

        let contract_address = Address::from_str(&contract_address_str)
            .context("Invalid CONTRACT_ADDRESS format")?;

        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set in .env")?;

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            start_block: optional_var("START_BLOCK")?,
            confirmations: var_or("CONFIRMATIONS", sync_defaults.confirmations)?,
            batch_size: var_or("BATCH_SIZE", sync_defaults.batch_size)?,
            max_retries: var_or("MAX_RETRIES", sync_defaults.max_retries)?,
            retry_delay: millis_or("RETRY_DELAY_MS", sync_defaults.retry_delay)?,
            rate_limit_delay: millis_or("RATE_LIMIT_DELAY_MS", sync_defaults.rate_limit_delay)?,
            reorg_check_depth: var_or("REORG_CHECK_DEPTH", sync_defaults.reorg_check_depth)?,
            poll_interval: millis_or("POLL_INTERVAL_MS", sync_defaults.poll_interval)?,
        };
        if sync.batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be greater than zero");
        }

        let health_defaults = HealthConfig::default();
        let health = HealthConfig {
            check_interval: millis_or("HEALTH_CHECK_INTERVAL_MS", health_defaults.check_interval)?,
            check_timeout: millis_or("HEALTH_CHECK_TIMEOUT_MS", health_defaults.check_timeout)?,
            failure_threshold: var_or(
                "HEALTH_FAILURE_THRESHOLD",
                health_defaults.failure_threshold,
            )?,
            success_threshold: var_or(
                "HEALTH_SUCCESS_THRESHOLD",
                health_defaults.success_threshold,
            )?,
        };

        let breaker_defaults = BreakerConfig::default();
        let breaker = BreakerConfig {
            failure_threshold: var_or(
                "CIRCUIT_FAILURE_THRESHOLD",
                breaker_defaults.failure_threshold,
            )?,
            success_threshold: var_or(
                "CIRCUIT_SUCCESS_THRESHOLD",
                breaker_defaults.success_threshold,
            )?,
            reset_timeout: millis_or("CIRCUIT_RESET_TIMEOUT_MS", breaker_defaults.reset_timeout)?,
        };

        Ok(Config {
            rpc_url,
            backup_rpc_urls,
            contract_address,
            database_url,
            chain_id: var_or("CHAIN_ID", 1)?,
            sync,
            health,
            breaker,
            rpc_timeout: millis_or("RPC_TIMEOUT_MS", Duration::from_secs(10))?,
            owner_lookup_concurrency: var_or("OWNER_LOOKUP_CONCURRENCY", 10)?,
            verify_accuracy_threshold: var_or("VERIFY_ACCURACY_THRESHOLD", 0.99)?,
        })
    }

    /// Primary first, then backups in configured order.
    pub fn rpc_urls(&self) -> Vec<String> {
        std::iter::once(self.rpc_url.clone())
            .chain(self.backup_rpc_urls.iter().cloned())
            .collect()
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}

fn optional_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid {key} value: {raw}")),
        _ => Ok(None),
    }
}

fn var_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(optional_var(key)?.unwrap_or(default))
}

fn millis_or(key: &str, default: Duration) -> Result<Duration> {
    Ok(optional_var::<u64>(key)?
        .map(Duration::from_millis)
        .unwrap_or(default))
}
