pub mod circuit_breaker;
pub mod executor;

pub use circuit_breaker::{CircuitBreaker, CircuitHealth, CircuitMetrics, CircuitState};
pub use executor::ResilienceExecutor;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ResilienceError {
    #[error("circuit '{name}' is open")]
    CircuitOpen { name: String },

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout { operation: String, after: Duration },

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl ResilienceError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}
