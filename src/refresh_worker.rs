use crate::contract::ResilientContract;
use crate::owner_lookup::{RefreshOutcome, refresh_owners};
use crate::repository::{Database, SyncStateRepository, TokenFilter, TokenRepository};
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cap on tokens pulled from the store for a single owner refresh.
const MAX_TOKENS_PER_OWNER: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshJob {
    /// Re-read every stored token currently attributed to this address.
    Owner(Address),
    Tokens(Vec<U256>),
}

#[derive(Debug)]
pub struct RefreshReport {
    pub job: RefreshJob,
    pub outcome: Result<RefreshOutcome>,
}

/// Sending side of the refresh queue.
#[derive(Clone)]
pub struct RefreshHandle {
    tx: mpsc::Sender<RefreshJob>,
}

impl RefreshHandle {
    /// Waits for queue capacity.
    pub async fn enqueue(&self, job: RefreshJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .context("Refresh worker has shut down")
    }

    /// Returns an error instead of waiting when the queue is full.
    pub fn try_enqueue(&self, job: RefreshJob) -> Result<()> {
        self.tx
            .try_send(job)
            .map_err(|e| anyhow::anyhow!("Failed to enqueue refresh job: {}", e))
    }
}

pub struct RefreshWorker {
    pub handle: RefreshHandle,
    pub reports: mpsc::Receiver<RefreshReport>,
    pub task: JoinHandle<()>,
}

/// Spawns the background owner-refresh worker. Jobs run one at a time; each
/// job's outcome, success or failure, is delivered on `reports`. The worker
/// exits once every [`RefreshHandle`] is dropped.
pub fn spawn_refresh_worker(
    contract: ResilientContract,
    db: Database,
    concurrency: usize,
    capacity: usize,
) -> RefreshWorker {
    let (tx, mut rx) = mpsc::channel::<RefreshJob>(capacity.max(1));
    let (report_tx, reports) = mpsc::channel::<RefreshReport>(capacity.max(1));

    let task = tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            let outcome = run_job(&contract, &db, &job, concurrency).await;
            if let Err(e) = &outcome {
                warn!("Refresh job {:?} failed: {:#}", job, e);
            }
            if report_tx.send(RefreshReport { job, outcome }).await.is_err() {
                debug!("Refresh report dropped; receiver closed");
            }
        }
        info!("Refresh worker stopped");
    });

    RefreshWorker {
        handle: RefreshHandle { tx },
        reports,
        task,
    }
}

async fn run_job(
    contract: &ResilientContract,
    db: &Database,
    job: &RefreshJob,
    concurrency: usize,
) -> Result<RefreshOutcome> {
    let address = contract.address();
    let token_ids = match job {
        RefreshJob::Tokens(ids) => ids.clone(),
        RefreshJob::Owner(owner) => db.with_conn(|conn| {
            let tokens = TokenRepository::new(conn).find(
                &address,
                &[TokenFilter::Owner(*owner)],
                MAX_TOKENS_PER_OWNER,
                0,
            )?;
            Ok(tokens.into_iter().map(|t| t.token_id).collect())
        })?,
    };

    let synced_block = db.with_conn(|conn| {
        let state = SyncStateRepository::new(conn).get(&address)?;
        Ok(state.map(|s| s.current_block.saturating_sub(1)).unwrap_or_default())
    })?;

    refresh_owners(contract, db, &token_ids, concurrency, synced_block).await
}
