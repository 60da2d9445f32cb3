use alloy::rpc::types::Log;
use alloy::sol;
use alloy::sol_types::SolEvent;
use alloy_primitives::{Address, B256, U256};
use anyhow::{Context, Result};
use tracing::debug;

sol! {
    event Transfer(address indexed from, address indexed to, uint256 indexed tokenId);

    function ownerOf(uint256 tokenId) external view returns (address);
    function tokenURI(uint256 tokenId) external view returns (string);
    function balanceOf(address owner) external view returns (uint256);
    function totalSupply() external view returns (uint256);
    function name() external view returns (string);
    function symbol() external view returns (string);
}

/// A decoded ERC-721 `Transfer` log together with its chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub contract_address: Address,
    pub token_id: U256,
    pub from: Address,
    pub to: Address,
    pub block_number: u64,
    pub block_hash: B256,
    pub block_timestamp: Option<u64>,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl TransferLog {
    pub fn is_mint(&self) -> bool {
        self.from == Address::ZERO
    }
}

pub fn decode_transfer_event(log: &Log) -> Result<TransferLog> {
    let log_data = log.data();
    let decoded = Transfer::decode_raw_log(log.topics(), &log_data.data)?;

    Ok(TransferLog {
        contract_address: log.address(),
        token_id: decoded.tokenId,
        from: decoded.from,
        to: decoded.to,
        block_number: log.block_number.context("log is missing block number")?,
        block_hash: log.block_hash.context("log is missing block hash")?,
        block_timestamp: log.block_timestamp,
        transaction_hash: log
            .transaction_hash
            .context("log is missing transaction hash")?,
        transaction_index: log.transaction_index.unwrap_or_default(),
        log_index: log.log_index.context("log is missing log index")?,
    })
}

/// Decodes a batch of `Transfer` logs in chain order. Logs flagged as
/// removed are skipped; any other log that fails to decode fails the whole
/// batch so the caller never advances past an event it could not apply.
pub fn decode_transfer_logs(logs: &[Log]) -> Result<Vec<TransferLog>> {
    let mut transfers = Vec::with_capacity(logs.len());
    for log in logs {
        if log.removed {
            debug!("Skipping removed log in block {:?}", log.block_number);
            continue;
        }
        let transfer = decode_transfer_event(log).with_context(|| {
            format!(
                "Failed to decode Transfer log {:?}#{:?} in block {:?}",
                log.transaction_hash, log.log_index, log.block_number
            )
        })?;
        transfers.push(transfer);
    }
    transfers.sort_by_key(|t| (t.block_number, t.log_index));
    Ok(transfers)
}
