use crate::contract::ResilientContract;
use crate::provider_manager::ProviderManager;
use crate::query::formatters::{
    OutputFormat, format_progress, format_providers, format_stats, format_status, format_tokens,
    format_transfers, format_verification,
};
use crate::repository::{
    Database, SyncStateRepository, TokenFilter, TokenRepository, TransferRepository,
};
use crate::scanner::{SyncProgress, load_status};
use crate::verification::verify_sample;
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use std::str::FromStr;

fn parse_address(raw: &str, what: &str) -> Result<Address> {
    Address::from_str(raw).map_err(|_| anyhow::anyhow!("Invalid {} address: {}", what, raw))
}

fn parse_token_id(raw: &str) -> Result<U256> {
    U256::from_str(raw).map_err(|_| anyhow::anyhow!("Invalid token id: {}", raw))
}

pub fn cmd_status(db: &Database, contract: &Address, format: &OutputFormat) -> Result<()> {
    // read-only view; the indexer process owns the running flag
    let status = load_status(db, contract, false, None)?;
    println!("{}", format_status(&status, format));
    Ok(())
}

pub fn cmd_progress(db: &Database, contract: &Address, format: &OutputFormat) -> Result<()> {
    let state = db.with_conn(|conn| SyncStateRepository::new(conn).get(contract))?;
    let progress = SyncProgress::from_state(state.as_ref(), None);
    println!("{}", format_progress(&progress, format));
    Ok(())
}

pub fn cmd_stats(db: &Database, contract: &Address, format: &OutputFormat) -> Result<()> {
    let stats = db.with_conn(|conn| TransferRepository::new(conn).get_statistics(contract))?;
    println!("{}", format_stats(&stats, format));
    Ok(())
}

/// Stored owner of one or more tokens; never touches the chain.
pub fn cmd_owner(
    db: &Database,
    contract: &Address,
    token_ids: &[String],
    format: &OutputFormat,
) -> Result<()> {
    let ids = token_ids
        .iter()
        .map(|raw| parse_token_id(raw))
        .collect::<Result<Vec<_>>>()?;

    let tokens = db.with_conn(|conn| {
        let repo = TokenRepository::new(conn);
        let mut tokens = Vec::with_capacity(ids.len());
        for id in &ids {
            match repo.get(contract, id)? {
                Some(token) => tokens.push(token),
                None => eprintln!("Token {id} is not indexed"),
            }
        }
        Ok(tokens)
    })?;

    println!("{}", format_tokens(&tokens, format));
    Ok(())
}

#[derive(Default)]
pub struct TokenQuery {
    pub owner: Option<String>,
    pub not_owner: Option<String>,
    pub unsynced: bool,
    pub limit: usize,
    pub offset: usize,
}

impl TokenQuery {
    fn filters(&self) -> Result<Vec<TokenFilter>> {
        let mut filters = Vec::new();
        if let Some(owner) = &self.owner {
            filters.push(TokenFilter::Owner(parse_address(owner, "owner")?));
        }
        if let Some(owner) = &self.not_owner {
            filters.push(TokenFilter::NotOwner(parse_address(owner, "owner")?));
        }
        if self.unsynced {
            filters.push(TokenFilter::Unsynced);
        }
        Ok(filters)
    }
}

pub fn cmd_tokens(
    db: &Database,
    contract: &Address,
    query: TokenQuery,
    format: &OutputFormat,
) -> Result<()> {
    let filters = query.filters()?;
    let (tokens, total) = db.with_conn(|conn| {
        let repo = TokenRepository::new(conn);
        Ok((
            repo.find(contract, &filters, query.limit, query.offset)?,
            repo.count(contract, &filters)?,
        ))
    })?;

    println!("{}", format_tokens(&tokens, format));
    if let OutputFormat::Table = format {
        println!(
            "Showing {} of {} tokens (offset {})",
            tokens.len(),
            total,
            query.offset
        );
    }
    Ok(())
}

#[derive(Default)]
pub struct TransferQuery {
    pub token_id: Option<String>,
    pub address: Option<String>,
    pub block: Option<u64>,
    pub block_range: Option<(u64, u64)>,
    pub limit: usize,
    pub offset: usize,
}

pub fn cmd_transfers(
    db: &Database,
    contract: &Address,
    query: TransferQuery,
    format: &OutputFormat,
) -> Result<()> {
    let token_id = query.token_id.as_deref().map(parse_token_id).transpose()?;
    let address = query
        .address
        .as_deref()
        .map(|raw| parse_address(raw, "transfer"))
        .transpose()?;

    let block_range = match query.block {
        Some(block) => Some((block, block)),
        None => query.block_range,
    };

    if token_id.is_none() && address.is_none() && block_range.is_none() {
        return Err(anyhow::anyhow!(
            "Please specify at least one filter: --token-id, --address, --block, or --block-range"
        ));
    }

    let transfers = db.with_conn(|conn| {
        TransferRepository::new(conn).query_transfers(
            contract,
            token_id.as_ref(),
            address.as_ref(),
            block_range,
            query.limit,
            query.offset,
        )
    })?;

    println!("{}", format_transfers(&transfers, format));
    Ok(())
}

pub async fn cmd_verify(
    contract: &ResilientContract,
    db: &Database,
    sample_size: usize,
    concurrency: usize,
    accuracy_threshold: f64,
    format: &OutputFormat,
) -> Result<bool> {
    let report = verify_sample(contract, db, sample_size, concurrency, accuracy_threshold)
        .await
        .context("Verification failed to run")?;
    println!("{}", format_verification(&report, format));
    Ok(report.passed)
}

/// Probes every configured endpoint once and prints the resulting health.
pub async fn cmd_providers(manager: &ProviderManager, format: &OutputFormat) -> Result<()> {
    manager.check_all_providers().await;
    let summary = manager.get_health_summary().await;
    println!("{}", format_providers(&summary, format));
    Ok(())
}
