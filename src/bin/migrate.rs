use anyhow::{Context, Result};
use nft_chain_sync::repository::Database;
use tracing::info;

fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    dotenv::dotenv().ok();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

    info!("Running migrations on database: {}", database_url);

    let _db = Database::new(&database_url)?;

    info!("Migrations completed successfully");

    Ok(())
}
