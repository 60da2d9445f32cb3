use super::{CircuitBreaker, ResilienceError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// Hard timeout + circuit breaker + optional fallback around a single call.
#[derive(Debug, Clone)]
pub struct ResilienceExecutor {
    breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl ResilienceExecutor {
    pub fn new(breaker: Arc<CircuitBreaker>, timeout: Duration) -> Self {
        Self { breaker, timeout }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let limit = self.timeout;
        self.breaker
            .execute(|| async move {
                match timeout(limit, call()).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(ResilienceError::Failed(e)),
                    Err(_) => Err(ResilienceError::Timeout {
                        operation: operation.to_string(),
                        after: limit,
                    }),
                }
            })
            .await
    }

    /// Runs `call`, degrading to `fallback` on short-circuit, timeout or failure.
    pub async fn execute_with_fallback<T, F, Fut>(&self, operation: &str, call: F, fallback: T) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_or_else(operation, call, |_| async move { fallback })
            .await
    }

    pub async fn execute_or_else<T, F, Fut, G, GFut>(
        &self,
        operation: &str,
        call: F,
        fallback: G,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce(ResilienceError) -> GFut,
        GFut: Future<Output = T>,
    {
        match self.execute(operation, call).await {
            Ok(value) => value,
            Err(e) => {
                warn!("{} degraded to fallback: {}", operation, e);
                fallback(e).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::resilience::CircuitState;

    fn executor(timeout_ms: u64) -> ResilienceExecutor {
        let breaker = Arc::new(CircuitBreaker::new(
            "rpc",
            BreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
            },
        ));
        ResilienceExecutor::new(breaker, Duration::from_millis(timeout_ms))
    }

    #[tokio::test]
    async fn slow_call_fails_with_descriptive_timeout() {
        let executor = executor(10);
        let result = executor
            .execute("ownerOf(1)", || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1u32)
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ResilienceError::Timeout { .. }));
        assert!(err.to_string().contains("ownerOf(1) timed out after 10ms"));
    }

    #[tokio::test]
    async fn failures_fall_back_and_trip_the_shared_breaker() {
        let executor = executor(1_000);
        for _ in 0..2 {
            let value = executor
                .execute_with_fallback(
                    "balanceOf",
                    || async { Err::<u64, _>(anyhow::anyhow!("connection reset")) },
                    0,
                )
                .await;
            assert_eq!(value, 0);
        }
        assert_eq!(executor.breaker().state(), CircuitState::Open);

        let err = executor
            .execute("totalSupply", || async { Ok(10u64) })
            .await
            .unwrap_err();
        assert!(err.is_circuit_open());
    }

    #[tokio::test]
    async fn passes_through_successful_values() {
        let executor = executor(1_000);
        let value = executor
            .execute_with_fallback("name", || async { Ok("Punks".to_string()) }, String::new())
            .await;
        assert_eq!(value, "Punks");
    }
}
