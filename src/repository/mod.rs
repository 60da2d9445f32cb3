pub mod database;
pub mod models;
pub mod sync_state_repository;
pub mod token_repository;
pub mod transfer_repository;

pub use database::Database;
pub use models::{SyncState, SyncType, Token, TransferEvent};
pub use sync_state_repository::SyncStateRepository;
pub use token_repository::{TokenFilter, TokenRepository};
pub use transfer_repository::{TransferRepository, TransferStats};
