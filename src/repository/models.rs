use crate::events::TransferLog;
use alloy_primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub contract_address: Address,
    pub token_id: U256,
    /// `None` once every transfer that produced this token was rolled back.
    pub owner_address: Option<Address>,
    pub token_uri: Option<String>,
    pub last_transfer_block: Option<u64>,
    pub last_transfer_tx_hash: Option<B256>,
    pub last_transfer_log_index: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_block: u64,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferEvent {
    pub transaction_hash: B256,
    pub log_index: u64,
    pub contract_address: Address,
    pub token_id: U256,
    pub from_address: Address,
    pub to_address: Address,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: Option<u64>,
    pub transaction_index: u64,
    pub processed_at: DateTime<Utc>,
}

impl TransferEvent {
    pub fn from_log(log: &TransferLog, processed_at: DateTime<Utc>) -> Self {
        Self {
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
            contract_address: log.contract_address,
            token_id: log.token_id,
            from_address: log.from,
            to_address: log.to,
            block_number: log.block_number,
            block_hash: log.block_hash,
            block_timestamp: log.block_timestamp,
            transaction_index: log.transaction_index,
            processed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

impl FromStr for SyncType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(SyncType::Full),
            "incremental" => Ok(SyncType::Incremental),
            other => Err(anyhow::anyhow!("Unknown sync type: {}", other)),
        }
    }
}

/// Durable per-contract checkpoint.
///
/// `current_block` is the next block to process. In steady state
/// `start_block <= finalized_to_block + confirmations <= current_block <= head_block + 1`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub contract_address: Address,
    pub sync_type: SyncType,
    pub start_block: u64,
    pub current_block: u64,
    pub finalized_to_block: u64,
    pub head_block: u64,
    pub tokens_discovered: u64,
    pub tokens_enriched: u64,
    pub transfers_count: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub confirmations: u64,
    pub batch_size: u64,
    pub error_count: u64,
}

impl SyncState {
    pub fn new(
        contract_address: Address,
        start_block: u64,
        head_block: u64,
        confirmations: u64,
        batch_size: u64,
    ) -> Self {
        let now = Utc::now();
        let mut state = Self {
            contract_address,
            sync_type: SyncType::Full,
            start_block,
            current_block: start_block,
            finalized_to_block: 0,
            head_block,
            tokens_discovered: 0,
            tokens_enriched: 0,
            transfers_count: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            confirmations,
            batch_size,
            error_count: 0,
        };
        state.recompute_finalized();
        state
    }

    pub fn recompute_finalized(&mut self) {
        if self.current_block > self.confirmations {
            self.finalized_to_block = self.current_block - self.confirmations;
        }
    }

    pub fn is_caught_up(&self) -> bool {
        self.current_block > self.head_block
    }
}

/// Zero-pads a token id to 78 digits so text ordering is numeric ordering.
/// U256 max is approximately 10^77, so 78 digits is sufficient.
pub fn pad_token_id(token_id: &U256) -> String {
    format!("{token_id:0>78}")
}

pub fn parse_token_id(padded: &str) -> anyhow::Result<U256> {
    let trimmed = padded.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str(trimmed).map_err(|_| anyhow::anyhow!("Invalid token id in database: {}", padded))
}

pub fn format_address(address: &Address) -> String {
    format!("{address:?}")
}

pub fn format_hash(hash: &B256) -> String {
    format!("{hash:?}")
}

pub fn to_timestamp(at: &DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub fn from_timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

pub(crate) fn conversion_error<E>(column: usize, error: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(error))
}

pub(crate) fn column_address(row: &rusqlite::Row, column: usize) -> rusqlite::Result<Address> {
    Address::from_str(&row.get::<_, String>(column)?).map_err(|e| conversion_error(column, e))
}

pub(crate) fn column_hash(row: &rusqlite::Row, column: usize) -> rusqlite::Result<B256> {
    row.get::<_, String>(column)?
        .parse::<B256>()
        .map_err(|e| conversion_error(column, e))
}

pub(crate) fn column_token_id(row: &rusqlite::Row, column: usize) -> rusqlite::Result<U256> {
    parse_token_id(&row.get::<_, String>(column)?)
        .map_err(|e| conversion_error(column, std::io::Error::other(e.to_string())))
}
