use crate::chain::{HealthProbe, ProbeResult};
use crate::config::HealthConfig;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Debounced health of one configured RPC endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub url: String,
    pub is_healthy: bool,
    pub latency_ms: Option<u64>,
    pub block_number: Option<u64>,
    pub chain_id: Option<u64>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_checks: u64,
    pub successful_checks: u64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    fn new(url: String) -> Self {
        Self {
            url,
            is_healthy: true,
            latency_ms: None,
            block_number: None,
            chain_id: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_checks: 0,
            successful_checks: 0,
            last_checked_at: None,
            last_error: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            return 1.0;
        }
        self.successful_checks as f64 / self.total_checks as f64
    }

    /// Feeds one raw check into the debounce counters.
    fn record(&mut self, passed: bool, config: &HealthConfig) {
        self.total_checks += 1;
        self.last_checked_at = Some(Utc::now());

        if passed {
            self.successful_checks += 1;
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            self.last_error = None;
            if !self.is_healthy && self.consecutive_successes >= config.success_threshold {
                self.is_healthy = true;
                info!(
                    "Provider {} recovered after {} consecutive successful checks",
                    self.url, self.consecutive_successes
                );
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.is_healthy && self.consecutive_failures >= config.failure_threshold {
                self.is_healthy = false;
                warn!(
                    "Provider {} marked unhealthy after {} consecutive failed checks",
                    self.url, self.consecutive_failures
                );
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    pub url: String,
    pub is_healthy: bool,
    pub latency_ms: Option<u64>,
    pub block_number: Option<u64>,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub current: String,
    pub providers: Vec<ProviderSummary>,
}

struct Monitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the configured endpoints (primary first) and tracks which one to use.
pub struct ProviderManager {
    urls: Vec<String>,
    expected_chain_id: u64,
    config: HealthConfig,
    probe: Arc<dyn HealthProbe>,
    health: RwLock<Vec<ProviderHealth>>,
    current_provider: AtomicUsize,
    monitor: Mutex<Option<Monitor>>,
}

impl ProviderManager {
    pub fn new(
        urls: Vec<String>,
        expected_chain_id: u64,
        config: HealthConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self> {
        if urls.is_empty() {
            return Err(anyhow::anyhow!("At least one RPC URL must be provided"));
        }

        let health = urls.iter().cloned().map(ProviderHealth::new).collect();
        Ok(Self {
            urls,
            expected_chain_id,
            config,
            probe,
            health: RwLock::new(health),
            current_provider: AtomicUsize::new(0),
            monitor: Mutex::new(None),
        })
    }

    pub fn primary_url(&self) -> &str {
        &self.urls[0]
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    /// Current provider if healthy, else the first healthy one in configured
    /// order, else the primary.
    pub async fn get_healthy_provider(&self) -> String {
        let health = self.health.read().await;
        let current = self.current_provider.load(Ordering::Relaxed);
        if health[current].is_healthy {
            return health[current].url.clone();
        }

        match health.iter().position(|provider| provider.is_healthy) {
            Some(index) => {
                info!(
                    "Switching RPC provider from {} to {}",
                    health[current].url, health[index].url
                );
                self.current_provider.store(index, Ordering::Relaxed);
                health[index].url.clone()
            }
            None => {
                warn!(
                    "No healthy RPC providers, falling back to primary {}",
                    self.primary_url()
                );
                self.current_provider.store(0, Ordering::Relaxed);
                self.primary_url().to_string()
            }
        }
    }

    pub async fn check_all_providers(&self) {
        let checks = self.urls.iter().map(|url| async move {
            let started = Instant::now();
            let outcome = match timeout(self.config.check_timeout, self.probe.probe(url)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "health check timed out after {}ms",
                    self.config.check_timeout.as_millis()
                )),
            };
            (outcome, started.elapsed())
        });
        let results = join_all(checks).await;

        let mut health = self.health.write().await;
        for (provider, (outcome, latency)) in health.iter_mut().zip(results) {
            let passed = match &outcome {
                Ok(probe) => self.evaluate(provider, probe),
                Err(e) => {
                    debug!("Health check failed for {}: {}", provider.url, e);
                    provider.last_error = Some(e.to_string());
                    false
                }
            };
            if passed {
                provider.latency_ms = Some(latency.as_millis() as u64);
            }
            provider.record(passed, &self.config);
        }
    }

    fn evaluate(&self, provider: &mut ProviderHealth, probe: &ProbeResult) -> bool {
        provider.chain_id = Some(probe.chain_id);
        provider.block_number = Some(probe.block_number);

        if probe.chain_id != self.expected_chain_id {
            provider.last_error = Some(format!(
                "chain id {} does not match expected {}",
                probe.chain_id, self.expected_chain_id
            ));
            return false;
        }
        if probe.syncing {
            provider.last_error = Some("node is syncing".to_string());
            return false;
        }
        true
    }

    pub fn start_health_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if monitor.is_some() {
            warn!("Health monitoring already running");
            return;
        }

        let cancel = CancellationToken::new();
        let manager = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(manager.config.check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => manager.check_all_providers().await,
                }
            }
            debug!("Health monitoring loop exited");
        });

        info!(
            "Started health monitoring of {} provider(s) every {}s",
            self.urls.len(),
            self.config.check_interval.as_secs()
        );
        *monitor = Some(Monitor { cancel, handle });
    }

    pub fn stop_health_monitoring(&self) {
        let mut monitor = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(Monitor { cancel, handle }) = monitor.take() {
            cancel.cancel();
            drop(handle);
            info!("Stopped health monitoring");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub async fn get_health_summary(&self) -> HealthSummary {
        let health = self.health.read().await;
        let healthy = health.iter().filter(|p| p.is_healthy).count();
        let current = self.current_provider.load(Ordering::Relaxed);

        HealthSummary {
            total: health.len(),
            healthy,
            unhealthy: health.len() - healthy,
            current: health[current].url.clone(),
            providers: health
                .iter()
                .map(|p| ProviderSummary {
                    url: p.url.clone(),
                    is_healthy: p.is_healthy,
                    latency_ms: p.latency_ms,
                    block_number: p.block_number,
                    success_rate: p.success_rate(),
                })
                .collect(),
        }
    }

    pub async fn provider_health(&self) -> Vec<ProviderHealth> {
        self.health.read().await.clone()
    }

    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn mark_provider_unhealthy(&self, url: &str) -> Result<()> {
        let mut health = self.health.write().await;
        let provider = health
            .iter_mut()
            .find(|p| p.url == url)
            .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", url))?;
        provider.is_healthy = false;
        provider.consecutive_successes = 0;
        provider.consecutive_failures = self.config.failure_threshold;
        Ok(())
    }

    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn reset_provider_health(&self, url: &str) -> Result<()> {
        let mut health = self.health.write().await;
        let provider = health
            .iter_mut()
            .find(|p| p.url == url)
            .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", url))?;
        *provider = ProviderHealth::new(url.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    const PRIMARY: &str = "http://primary";
    const BACKUP: &str = "http://backup";

    /// Answers each URL from a script; `None` entries fail the probe.
    #[derive(Default)]
    struct ScriptedProbe {
        responses: std::sync::Mutex<HashMap<String, Vec<Option<ProbeResult>>>>,
    }

    impl ScriptedProbe {
        fn push(&self, url: &str, result: Option<ProbeResult>) {
            self.responses
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push(result);
        }
    }

    #[async_trait::async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, url: &str) -> Result<ProbeResult> {
            let mut responses = self.responses.lock().unwrap();
            let queue = responses.entry(url.to_string()).or_default();
            let next = if queue.is_empty() { Some(ok()) } else { queue.remove(0) };
            next.ok_or_else(|| anyhow::anyhow!("connection refused"))
        }
    }

    fn ok() -> ProbeResult {
        ProbeResult {
            chain_id: 1,
            block_number: 1_000,
            syncing: false,
        }
    }

    fn manager(probe: Arc<ScriptedProbe>) -> ProviderManager {
        ProviderManager::new(
            vec![PRIMARY.to_string(), BACKUP.to_string()],
            1,
            HealthConfig {
                check_interval: Duration::from_millis(10),
                check_timeout: Duration::from_millis(100),
                failure_threshold: 3,
                success_threshold: 5,
            },
            probe,
        )
        .unwrap()
    }

    async fn primary_health(manager: &ProviderManager) -> ProviderHealth {
        manager.provider_health().await.remove(0)
    }

    #[tokio::test]
    async fn sub_threshold_failure_streak_never_flaps() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.push(PRIMARY, None);
        probe.push(PRIMARY, None);
        probe.push(PRIMARY, Some(ok()));
        let manager = manager(probe);

        for _ in 0..3 {
            manager.check_all_providers().await;
            assert!(primary_health(&manager).await.is_healthy);
            assert_eq!(manager.get_healthy_provider().await, PRIMARY);
        }
        assert_eq!(primary_health(&manager).await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn fails_over_after_threshold_and_recovers_after_success_streak() {
        let probe = Arc::new(ScriptedProbe::default());
        for _ in 0..3 {
            probe.push(PRIMARY, None);
        }
        let manager = manager(probe);

        for _ in 0..3 {
            manager.check_all_providers().await;
        }
        assert!(!primary_health(&manager).await.is_healthy);
        assert_eq!(manager.get_healthy_provider().await, BACKUP);

        for round in 1..=5 {
            manager.check_all_providers().await;
            assert_eq!(primary_health(&manager).await.is_healthy, round == 5);
        }
        // the backup stays current until it degrades itself
        assert_eq!(manager.get_healthy_provider().await, BACKUP);
    }

    #[tokio::test]
    async fn wrong_chain_or_syncing_counts_as_failure() {
        let probe = Arc::new(ScriptedProbe::default());
        let wrong_chain = ProbeResult { chain_id: 5, ..ok() };
        let syncing = ProbeResult { syncing: true, ..ok() };
        probe.push(PRIMARY, Some(wrong_chain));
        probe.push(PRIMARY, Some(syncing));
        probe.push(PRIMARY, Some(wrong_chain));
        let manager = manager(probe);

        for _ in 0..3 {
            manager.check_all_providers().await;
        }
        let health = primary_health(&manager).await;
        assert!(!health.is_healthy);
        assert_eq!(health.chain_id, Some(5));
        assert!(health.last_error.unwrap().contains("does not match"));
    }

    #[tokio::test]
    async fn all_unhealthy_degrades_to_primary() -> Result<()> {
        let manager = manager(Arc::new(ScriptedProbe::default()));
        manager.mark_provider_unhealthy(PRIMARY).await?;
        manager.mark_provider_unhealthy(BACKUP).await?;
        assert_eq!(manager.get_healthy_provider().await, PRIMARY);

        let summary = manager.get_health_summary().await;
        assert_eq!((summary.total, summary.healthy, summary.unhealthy), (2, 0, 2));

        manager.reset_provider_health(BACKUP).await?;
        assert_eq!(manager.get_healthy_provider().await, BACKUP);
        assert!(manager.mark_provider_unhealthy("http://unknown").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn monitoring_lifecycle_is_idempotent() {
        let manager = Arc::new(manager(Arc::new(ScriptedProbe::default())));
        manager.stop_health_monitoring();
        assert!(!manager.is_monitoring());

        manager.start_health_monitoring();
        manager.start_health_monitoring();
        assert!(manager.is_monitoring());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(primary_health(&manager).await.total_checks > 0);

        manager.stop_health_monitoring();
        manager.stop_health_monitoring();
        assert!(!manager.is_monitoring());
    }
}
