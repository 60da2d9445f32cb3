use crate::chain::ChainReader;
use crate::config::SyncConfig;
use crate::contract::ResilientContract;
use crate::deployment::{find_deployment_block, validate_connection, validate_contract};
use crate::events::TransferLog;
use crate::reorg::{self, ReorgReport};
use crate::repository::{
    Database, SyncState, SyncStateRepository, SyncType, TokenFilter, TokenRepository,
    TransferEvent, TransferRepository,
};
use crate::resilience::ResilienceExecutor;
use crate::verification::{VerificationReport, verify_sample};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_retry::Retry;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    Scanning,
    CaughtUp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub percentage: f64,
    pub blocks_remaining: u64,
    pub eta_seconds: Option<u64>,
}

impl SyncProgress {
    /// Snapshot of how far `state` is through its block range.
    /// `blocks_per_second` is the throughput observed in this process, if any.
    pub fn from_state(state: Option<&SyncState>, blocks_per_second: Option<f64>) -> Self {
        let Some(state) = state else {
            return Self {
                phase: SyncPhase::Uninitialized,
                percentage: 0.0,
                blocks_remaining: 0,
                eta_seconds: None,
            };
        };

        if state.is_caught_up() {
            return Self {
                phase: SyncPhase::CaughtUp,
                percentage: 100.0,
                blocks_remaining: 0,
                eta_seconds: Some(0),
            };
        }

        let total = (state.head_block + 1).saturating_sub(state.start_block).max(1);
        let done = state.current_block.saturating_sub(state.start_block);
        let blocks_remaining = (state.head_block + 1).saturating_sub(state.current_block);
        let eta_seconds = blocks_per_second
            .filter(|rate| *rate > 0.0)
            .map(|rate| (blocks_remaining as f64 / rate).ceil() as u64);

        Self {
            phase: SyncPhase::Scanning,
            percentage: (done as f64 / total as f64 * 100.0).min(100.0),
            blocks_remaining,
            eta_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub last_finalized_block: u64,
    pub head_block: u64,
    pub lag: u64,
    pub tokens_count: u64,
    pub transfers_count: u64,
    pub is_running: bool,
    pub progress: Option<SyncProgress>,
}

/// Builds a status snapshot straight from the store, so read-only tooling
/// can report on a sync owned by another process.
pub fn load_status(
    db: &Database,
    contract: &Address,
    is_running: bool,
    blocks_per_second: Option<f64>,
) -> Result<SyncStatus> {
    db.with_conn(|conn| {
        let state = SyncStateRepository::new(conn).get(contract)?;
        let tokens_count = TokenRepository::new(conn).count(contract, &[TokenFilter::Synced])?;
        let transfers_count = TransferRepository::new(conn).count(contract)?;

        let (last_finalized_block, head_block) = state
            .as_ref()
            .map(|s| (s.finalized_to_block, s.head_block))
            .unwrap_or_default();

        Ok(SyncStatus {
            last_finalized_block,
            head_block,
            lag: head_block.saturating_sub(last_finalized_block),
            tokens_count,
            transfers_count,
            is_running,
            progress: state
                .as_ref()
                .map(|s| SyncProgress::from_state(Some(s), blocks_per_second)),
        })
    })
}

/// Blocks processed since the current run began.
#[derive(Debug, Default)]
struct Throughput {
    started: Option<Instant>,
    blocks: u64,
}

impl Throughput {
    fn record(&mut self, blocks: u64) {
        self.started.get_or_insert_with(Instant::now);
        self.blocks += blocks;
    }

    fn blocks_per_second(&self) -> Option<f64> {
        let elapsed = self.started?.elapsed().as_secs_f64();
        (elapsed > 0.0 && self.blocks > 0).then(|| self.blocks as f64 / elapsed)
    }
}

/// Clears the running flag when a sync pass ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Single-contract ERC-721 sync loop: discovers the start block, walks
/// `Transfer` logs batch by batch into the store, and rolls back reorged
/// ranges below the finality watermark.
pub struct ChainSyncEngine {
    chain: Arc<dyn ChainReader>,
    contract: ResilientContract,
    db: Database,
    expected_chain_id: u64,
    config: SyncConfig,
    owner_lookup_concurrency: usize,
    accuracy_threshold: f64,
    stop: AtomicBool,
    stop_signal: Notify,
    running: AtomicBool,
    throughput: Mutex<Throughput>,
}

impl ChainSyncEngine {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        executor: ResilienceExecutor,
        db: Database,
        contract_address: Address,
        expected_chain_id: u64,
        config: SyncConfig,
    ) -> Self {
        let contract = ResilientContract::new(chain.clone(), executor, contract_address);
        Self {
            chain,
            contract,
            db,
            expected_chain_id,
            config,
            owner_lookup_concurrency: 10,
            accuracy_threshold: 0.99,
            stop: AtomicBool::new(false),
            stop_signal: Notify::new(),
            running: AtomicBool::new(false),
            throughput: Mutex::new(Throughput::default()),
        }
    }

    pub fn with_owner_lookup_concurrency(mut self, concurrency: usize) -> Self {
        self.owner_lookup_concurrency = concurrency.max(1);
        self
    }

    pub fn with_accuracy_threshold(mut self, threshold: f64) -> Self {
        self.accuracy_threshold = threshold;
        self
    }

    pub fn contract(&self) -> &ResilientContract {
        &self.contract
    }

    pub fn contract_address(&self) -> Address {
        self.contract.address()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Validates the connection and contract, then loads the checkpoint or
    /// creates one starting at the configured block or the discovered
    /// deployment block.
    pub async fn initialize(&self) -> Result<SyncState> {
        validate_connection(self.chain.as_ref(), self.expected_chain_id).await?;
        validate_contract(&self.contract).await?;

        if let Some(state) = self.load_state()? {
            info!(
                "Resuming sync of {:?} at block {} (finalized to {})",
                state.contract_address, state.current_block, state.finalized_to_block
            );
            return Ok(state);
        }

        let head = self
            .chain
            .block_number()
            .await
            .context("Failed to fetch chain head")?;
        let start_block = match self.config.start_block {
            Some(block) => {
                info!("Using configured start block {}", block);
                block
            }
            None => {
                find_deployment_block(self.chain.as_ref(), self.contract_address(), head).await?
            }
        };

        let state = SyncState::new(
            self.contract_address(),
            start_block,
            head,
            self.config.confirmations,
            self.config.batch_size,
        );
        self.save_state(&state)?;
        info!(
            "Initialized sync of {:?} for blocks {}-{}",
            state.contract_address, start_block, head
        );
        Ok(state)
    }

    /// Syncs from the persisted checkpoint up to the current chain head.
    /// Returns early, fully resumable, if [`stop_sync`](Self::stop_sync) is
    /// called.
    pub async fn sync(&self) -> Result<SyncState> {
        let _guard = self.begin()?;
        self.stop.store(false, Ordering::SeqCst);
        self.sync_pass().await
    }

    /// Follow mode: syncs to the head, waits `poll_interval`, and repeats
    /// until stopped.
    pub async fn run(&self) -> Result<()> {
        let _guard = self.begin()?;
        self.stop.store(false, Ordering::SeqCst);

        loop {
            let state = self.sync_pass().await?;
            if self.stop_requested() {
                info!("Sync stopped at block {}", state.current_block);
                return Ok(());
            }

            debug!(
                "Caught up to block {}; polling again in {:?}",
                state.head_block, self.config.poll_interval
            );
            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = self.stop_signal.notified() => {}
            }
            if self.stop_requested() {
                info!("Sync stopped at block {}", state.current_block);
                return Ok(());
            }
        }
    }

    /// Asks the loop to exit before its next batch. In-flight calls finish.
    pub fn stop_sync(&self) {
        info!("Stop requested for sync of {:?}", self.contract_address());
        self.stop.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }

    /// Re-verifies the window below the finalized watermark and, if a reorg
    /// is found, rolls it back and replays up to the previous checkpoint.
    pub async fn check_for_reorgs(&self) -> Result<Option<ReorgReport>> {
        let _guard = self.begin()?;
        let mut state = self.require_state()?;
        let replay_to = state.current_block;

        let Some(report) = self.reconcile(&mut state).await? else {
            debug!("No reorg detected");
            return Ok(None);
        };

        while state.current_block < replay_to {
            state = self.process_batch_with_retry(&state).await?;
        }
        self.drop_orphaned_tokens(state.current_block)?;
        Ok(Some(report))
    }

    pub fn status(&self) -> Result<SyncStatus> {
        load_status(
            &self.db,
            &self.contract_address(),
            self.is_running(),
            self.blocks_per_second(),
        )
    }

    pub fn progress(&self) -> Result<SyncProgress> {
        let state = self.load_state()?;
        Ok(SyncProgress::from_state(
            state.as_ref(),
            self.blocks_per_second(),
        ))
    }

    pub async fn verify_sync(&self, sample_size: usize) -> Result<VerificationReport> {
        verify_sample(
            &self.contract,
            &self.db,
            sample_size,
            self.owner_lookup_concurrency,
            self.accuracy_threshold,
        )
        .await
    }

    fn begin(&self) -> Result<RunGuard<'_>> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!(
                "Sync of {:?} is already running",
                self.contract_address()
            );
        }
        Ok(RunGuard(&self.running))
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn blocks_per_second(&self) -> Option<f64> {
        self.throughput
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks_per_second()
    }

    fn load_state(&self) -> Result<Option<SyncState>> {
        let contract = self.contract_address();
        self.db
            .with_conn(|conn| SyncStateRepository::new(conn).get(&contract))
    }

    fn require_state(&self) -> Result<SyncState> {
        self.load_state()?
            .context("No sync state for contract; call initialize() first")
    }

    fn save_state(&self, state: &SyncState) -> Result<()> {
        self.db
            .with_conn(|conn| SyncStateRepository::new(conn).save(state))
    }

    async fn sync_pass(&self) -> Result<SyncState> {
        let mut state = self.require_state()?;
        state.head_block = self
            .chain
            .block_number()
            .await
            .context("Failed to fetch chain head")?;
        if state.completed_at.is_some() {
            state.sync_type = SyncType::Incremental;
        }
        state.updated_at = Utc::now();
        self.save_state(&state)?;

        info!(
            "Syncing blocks {}-{} ({} sync)",
            state.current_block,
            state.head_block,
            state.sync_type.as_str()
        );

        while !state.is_caught_up() {
            if self.stop_requested() {
                info!(
                    "Stop flag observed; sync paused at block {}",
                    state.current_block
                );
                return Ok(state);
            }

            let from = state.current_block;
            state = self.process_batch_with_retry(&state).await?;
            self.throughput
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .record(state.current_block.saturating_sub(from));

            if !self.config.rate_limit_delay.is_zero() {
                sleep(self.config.rate_limit_delay).await;
            }
        }

        self.drop_orphaned_tokens(state.current_block)?;
        state.completed_at = Some(Utc::now());
        state.updated_at = Utc::now();
        self.save_state(&state)?;
        info!(
            "Caught up to block {}: {} tokens, {} transfers",
            state.head_block, state.tokens_discovered, state.transfers_count
        );
        Ok(state)
    }

    /// Retries one batch with linearly growing delays. Every failed attempt
    /// is added to `error_count`; running out of retries is fatal.
    async fn process_batch_with_retry(&self, state: &SyncState) -> Result<SyncState> {
        let retry_delay = self.config.retry_delay;
        let strategy =
            (1..=self.config.max_retries as u32).map(move |attempt| retry_delay * attempt);

        let failures = AtomicU64::new(0);
        let failures_ref = &failures;
        let engine = self;
        let result = Retry::spawn(strategy, move || async move {
            let result = engine.process_batch(state).await;
            if let Err(e) = &result {
                let attempt = failures_ref.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(
                    "Batch starting at block {} failed (attempt {}): {:#}",
                    state.current_block, attempt, e
                );
            }
            result
        })
        .await;

        let failures = failures.load(Ordering::SeqCst);
        match result {
            Ok(mut next) => {
                if failures > 0 {
                    next.error_count += failures;
                    self.save_state(&next)?;
                }
                Ok(next)
            }
            Err(e) => {
                let mut failed = state.clone();
                failed.error_count += failures;
                failed.updated_at = Utc::now();
                self.save_state(&failed)?;
                Err(e.context(format!(
                    "Batch starting at block {} failed after {} attempts",
                    state.current_block, failures
                )))
            }
        }
    }

    async fn process_batch(&self, state: &SyncState) -> Result<SyncState> {
        let address = self.contract_address();
        let from = state.current_block;
        let to = from
            .saturating_add(self.config.batch_size.saturating_sub(1))
            .min(state.head_block);

        let mut logs = self
            .chain
            .transfer_logs(address, from, to)
            .await
            .with_context(|| format!("Failed to fetch transfer logs for blocks {from}-{to}"))?;
        self.fill_timestamps(&mut logs).await?;

        let now = Utc::now();
        let transfers: Vec<TransferEvent> = logs
            .iter()
            .map(|log| TransferEvent::from_log(log, now))
            .collect();

        let new_token_ids = self.unseen_token_ids(&transfers)?;
        let token_uris = self.fetch_token_uris(&new_token_ids).await;

        let mut next = state.clone();
        next.current_block = to + 1;
        next.recompute_finalized();
        next.updated_at = now;

        let (inserted, created) = self.db.transaction(|conn| {
            let transfer_repo = TransferRepository::new(conn);
            let token_repo = TokenRepository::new(conn);

            let inserted = transfer_repo.insert_batch(&transfers)?;
            let mut created = 0;
            for transfer in &transfers {
                if token_repo.upsert_from_transfer(transfer, now)? {
                    created += 1;
                }
            }
            for (token_id, uri) in &token_uris {
                token_repo.set_token_uri(&address, token_id, uri)?;
            }

            next.transfers_count = transfer_repo.count(&address)?;
            next.tokens_discovered = token_repo.count(&address, &[TokenFilter::Synced])?;
            next.tokens_enriched =
                token_repo.count(&address, &[TokenFilter::Synced, TokenFilter::Enriched])?;
            SyncStateRepository::new(conn).save(&next)?;
            Ok((inserted, created))
        })?;

        info!(
            "Processed blocks {}-{}: {} logs, {} new transfers, {} new tokens",
            from,
            to,
            logs.len(),
            inserted,
            created
        );

        self.reconcile(&mut next).await?;
        Ok(next)
    }

    /// Removes tokens left unsynced by a rollback whose replay reached
    /// `replayed_to` without their mint reappearing on the canonical chain.
    fn drop_orphaned_tokens(&self, replayed_to: u64) -> Result<()> {
        let address = self.contract_address();
        let dropped = self.db.with_conn(|conn| {
            TokenRepository::new(conn).delete_unsynced_before(&address, replayed_to)
        })?;
        if dropped > 0 {
            info!("Dropped {} tokens orphaned by a reorg", dropped);
        }
        Ok(())
    }

    /// Runs the reorg check over the window below `state`'s finalized
    /// watermark, rolling back into `state` on a hit.
    async fn reconcile(&self, state: &mut SyncState) -> Result<Option<ReorgReport>> {
        let Some(window) = reorg::check_window(state, self.config.reorg_check_depth) else {
            return Ok(None);
        };

        match reorg::detect_reorg(self.chain.as_ref(), &self.db, self.contract_address(), window)
            .await?
        {
            Some(range) => {
                warn!(
                    "Reorg detected in blocks {}-{}, rolling back",
                    range.start, range.end
                );
                reorg::rollback(&self.db, state, range).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn fill_timestamps(&self, logs: &mut [TransferLog]) -> Result<()> {
        let mut timestamps: HashMap<u64, Option<u64>> = HashMap::new();

        for log in logs.iter_mut().filter(|log| log.block_timestamp.is_none()) {
            let timestamp = match timestamps.get(&log.block_number) {
                Some(timestamp) => *timestamp,
                None => {
                    let header = self
                        .chain
                        .block_header(log.block_number)
                        .await
                        .with_context(|| format!("Failed to fetch block {}", log.block_number))?;
                    let timestamp = header.map(|h| h.timestamp);
                    timestamps.insert(log.block_number, timestamp);
                    timestamp
                }
            };
            log.block_timestamp = timestamp;
        }
        Ok(())
    }

    /// Token ids in `transfers` with no row in the store yet.
    fn unseen_token_ids(&self, transfers: &[TransferEvent]) -> Result<Vec<U256>> {
        let ids: Vec<U256> = transfers
            .iter()
            .map(|t| t.token_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let address = self.contract_address();
        let known: HashSet<U256> = self
            .db
            .with_conn(|conn| TokenRepository::new(conn).owners_of(&address, &ids))?
            .into_iter()
            .map(|(token_id, _)| token_id)
            .collect();
        Ok(ids.into_iter().filter(|id| !known.contains(id)).collect())
    }

    /// Best-effort `tokenURI` reads for newly seen tokens; failures leave the
    /// URI empty.
    async fn fetch_token_uris(&self, token_ids: &[U256]) -> Vec<(U256, String)> {
        let contract = &self.contract;
        stream::iter(token_ids.iter().copied())
            .map(|token_id| async move { (token_id, contract.try_token_uri(token_id).await) })
            .buffer_unordered(self.owner_lookup_concurrency)
            .filter_map(|(token_id, result)| async move {
                match result {
                    Ok(uri) => Some((token_id, uri)),
                    Err(e) => {
                        warn!("tokenURI({}) unavailable: {}", token_id, e);
                        None
                    }
                }
            })
            .collect()
            .await
    }
}
