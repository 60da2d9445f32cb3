use anyhow::Result;
use clap::{Parser, Subcommand};
use nft_chain_sync::config::Config;
use nft_chain_sync::contract::ResilientContract;
use nft_chain_sync::provider_manager::ProviderManager;
use nft_chain_sync::query::commands::{
    TokenQuery, TransferQuery, cmd_owner, cmd_progress, cmd_providers, cmd_stats, cmd_status,
    cmd_tokens, cmd_transfers, cmd_verify,
};
use nft_chain_sync::query::formatters::OutputFormat;
use nft_chain_sync::repository::Database;
use nft_chain_sync::resilience::{CircuitBreaker, ResilienceExecutor};
use nft_chain_sync::rpc::{Endpoints, RpcClient, RpcProbe};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "query")]
#[command(about = "Query indexed ERC-721 ownership data", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync checkpoint, lag and store counts
    Status,
    Progress,
    Stats,
    /// Stored owner of the given token ids
    Owner {
        #[arg(required = true)]
        token_ids: Vec<String>,
    },
    Tokens {
        #[arg(long)]
        owner: Option<String>,

        #[arg(long)]
        not_owner: Option<String>,

        #[arg(long, default_value = "false")]
        unsynced: bool,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    Transfers {
        #[arg(long)]
        token_id: Option<String>,

        #[arg(long)]
        address: Option<String>,

        #[arg(long)]
        block: Option<u64>,

        #[arg(long, num_args = 2, value_names = ["START", "END"])]
        block_range: Option<Vec<u64>>,

        #[arg(long, default_value = "100")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Compare a random sample of stored owners against the chain
    Verify {
        #[arg(default_value = "100")]
        sample_size: usize,
    },
    /// Probe every configured RPC endpoint once
    Providers,
}

fn connect(config: &Config) -> Result<(Arc<ProviderManager>, RpcClient)> {
    let rpc_urls = config.rpc_urls();
    let endpoints = Endpoints::connect(&rpc_urls)?;
    let manager = Arc::new(ProviderManager::new(
        rpc_urls,
        config.chain_id,
        config.health.clone(),
        Arc::new(RpcProbe::new(endpoints.clone())),
    )?);

    let client =
        RpcClient::new(endpoints, manager.clone()).with_request_timeout(config.rpc_timeout);
    Ok((manager, client))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());

    let config = Config::from_env()?;
    let db = Database::new(&config.database_url)?;
    let contract = &config.contract_address;

    match cli.command {
        Commands::Status => cmd_status(&db, contract, &format)?,
        Commands::Progress => cmd_progress(&db, contract, &format)?,
        Commands::Stats => cmd_stats(&db, contract, &format)?,
        Commands::Owner { token_ids } => cmd_owner(&db, contract, &token_ids, &format)?,
        Commands::Tokens {
            owner,
            not_owner,
            unsynced,
            limit,
            offset,
        } => {
            let query = TokenQuery {
                owner,
                not_owner,
                unsynced,
                limit,
                offset,
            };
            cmd_tokens(&db, contract, query, &format)?;
        }
        Commands::Transfers {
            token_id,
            address,
            block,
            block_range,
            limit,
            offset,
        } => {
            let range = block_range.and_then(|v| match v.as_slice() {
                [start, end] => Some((*start, *end)),
                _ => None,
            });
            let query = TransferQuery {
                token_id,
                address,
                block,
                block_range: range,
                limit,
                offset,
            };
            cmd_transfers(&db, contract, query, &format)?;
        }
        Commands::Verify { sample_size } => {
            let (_manager, client) = connect(&config)?;
            let breaker = Arc::new(CircuitBreaker::new("rpc", config.breaker.clone()));
            let reads = ResilientContract::new(
                Arc::new(client),
                ResilienceExecutor::new(breaker, config.rpc_timeout),
                config.contract_address,
            );
            let passed = cmd_verify(
                &reads,
                &db,
                sample_size,
                config.owner_lookup_concurrency,
                config.verify_accuracy_threshold,
                &format,
            )
            .await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Providers => {
            let (manager, _client) = connect(&config)?;
            cmd_providers(&manager, &format).await?;
        }
    }

    Ok(())
}
