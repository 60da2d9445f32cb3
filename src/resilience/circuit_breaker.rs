use super::ResilienceError;
use crate::config::BreakerConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_state_change_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitHealth {
    pub healthy: bool,
    pub state: CircuitState,
    pub message: String,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    total_calls: u64,
    rejected_calls: u64,
    opened_at: Option<Instant>,
    /// Set while the single HALF_OPEN trial call is running.
    trial_in_flight: bool,
    last_failure_at: Option<DateTime<Utc>>,
    last_state_change_at: DateTime<Utc>,
}

impl BreakerInner {
    fn transition(&mut self, name: &str, next: CircuitState) {
        if self.state == next {
            return;
        }
        match next {
            CircuitState::Open => warn!(
                "Circuit '{}' opened after {} failures",
                name, self.failure_count
            ),
            CircuitState::HalfOpen => info!("Circuit '{}' half-open, probing recovery", name),
            CircuitState::Closed => info!("Circuit '{}' closed", name),
        }
        self.state = next;
        self.last_state_change_at = Utc::now();
        self.opened_at = (next == CircuitState::Open).then(Instant::now);
        self.trial_in_flight = false;
        if next != CircuitState::Open {
            self.success_count = 0;
        }
        if next == CircuitState::Closed {
            self.failure_count = 0;
        }
    }
}

/// Three-state breaker guarding any fallible async operation.
///
/// The OPEN to HALF_OPEN transition is lazy: it happens on the first access
/// after `reset_timeout`, whether that access is a call or a metrics read.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                total_calls: 0,
                rejected_calls: 0,
                opened_at: None,
                trial_in_flight: false,
                last_failure_at: None,
                last_state_change_at: Utc::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_auto_reset(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
        if elapsed >= self.config.reset_timeout {
            inner.transition(&self.name, CircuitState::HalfOpen);
        }
    }

    /// Admits a call, or returns `None` when it must be short-circuited.
    /// While HALF_OPEN only one trial call is admitted at a time.
    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut inner = self.lock();
        self.check_auto_reset(&mut inner);
        inner.total_calls += 1;
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.rejected_calls += 1;
                return None;
            }
        };
        Some(Permit {
            breaker: self,
            trial,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen if trial => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition(&self.name, CircuitState::Closed);
                }
            }
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(&self.name, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                inner.failure_count += 1;
                inner.transition(&self.name, CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Runs `operation` unless the circuit is open.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let Some(permit) = self.try_acquire() else {
            return Err(ResilienceError::CircuitOpen {
                name: self.name.clone(),
            });
        };

        match operation().await {
            Ok(value) => {
                self.on_success(permit.trial);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(permit.trial);
                Err(e)
            }
        }
    }

    /// Like [`execute`](Self::execute), but a short-circuit or failure is
    /// answered by `fallback` instead of an error.
    pub async fn execute_or_else<T, F, Fut, G, GFut>(&self, operation: F, fallback: G) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        G: FnOnce(ResilienceError) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(operation).await {
            Ok(value) => value,
            Err(e) => fallback(e).await,
        }
    }

    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.check_auto_reset(&mut inner);
        inner.state
    }

    pub fn get_metrics(&self) -> CircuitMetrics {
        let mut inner = self.lock();
        self.check_auto_reset(&mut inner);
        CircuitMetrics {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_at: inner.last_failure_at,
            last_state_change_at: inner.last_state_change_at,
        }
    }

    pub fn get_health_status(&self) -> CircuitHealth {
        let metrics = self.get_metrics();
        let message = match metrics.state {
            CircuitState::Closed => "operating normally".to_string(),
            CircuitState::HalfOpen => "testing recovery".to_string(),
            CircuitState::Open => format!(
                "rejecting calls after {} consecutive failures",
                metrics.failure_count
            ),
        };
        CircuitHealth {
            healthy: metrics.state == CircuitState::Closed,
            state: metrics.state,
            message,
        }
    }

    /// Forces the breaker closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.transition(&self.name, CircuitState::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
    }
}

/// Admission for one call. Dropping a trial permit frees the HALF_OPEN slot,
/// including when the call's future is cancelled mid-flight.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial {
            self.breaker.lock().trial_in_flight = false;
        }
    }
}
