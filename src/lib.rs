pub mod chain;
pub mod config;
pub mod contract;
pub mod deployment;
pub mod events;
pub mod owner_lookup;
pub mod provider_manager;
pub mod query;
pub mod refresh_worker;
pub mod reorg;
pub mod repository;
pub mod resilience;
pub mod rpc;
pub mod scanner;
pub mod verification;

#[cfg(test)]
pub(crate) mod test_utils;
