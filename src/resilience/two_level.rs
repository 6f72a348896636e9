//! Service-wide breaker layered over per-operation breakers.

use super::circuit_breaker::CircuitBreaker;
use super::config::CircuitBreakerConfig;
use super::registry::CircuitBreakerRegistry;
use super::state::State;
use crate::CallError;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// One coarse breaker for a whole service plus one fine breaker per operation.
///
/// A failing operation (say, "send_template") trips only its own breaker, while
/// the service breaker aggregates outcomes from every operation and trips when the
/// provider as a whole is down.
pub struct TwoLevelCircuitBreaker {
    service: Arc<CircuitBreaker>,
    operations: CircuitBreakerRegistry,
}

impl TwoLevelCircuitBreaker {
    pub fn new(service_config: CircuitBreakerConfig, operation_config: CircuitBreakerConfig) -> Self {
        Self {
            service: CircuitBreaker::new(service_config),
            operations: CircuitBreakerRegistry::new(operation_config),
        }
    }

    /// Run `f` under the service breaker and the breaker named `operation`.
    ///
    /// An open service breaker rejects before the operation breaker is looked up.
    /// Outcomes that reached the resource are then fed to the service breaker;
    /// a rejection by the operation breaker is not, since nothing was called.
    pub async fn execute<F, Fut, T, E>(&self, operation: &str, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        if self.service.state() == State::Open {
            debug!(service = %self.service.name(), operation, "rejected by service breaker");
            return Err(CallError::CircuitOpen);
        }

        let outcome = self.operations.get(operation).execute(f).await;
        if !matches!(outcome, Err(CallError::CircuitOpen)) {
            self.service.observe_result(&outcome);
        }
        outcome
    }

    pub fn service_state(&self) -> State {
        self.service.state()
    }

    pub fn operation_state(&self, operation: &str) -> State {
        self.operations.get(operation).state()
    }

    pub fn service(&self) -> &Arc<CircuitBreaker> {
        &self.service
    }

    pub fn operations(&self) -> &CircuitBreakerRegistry {
        &self.operations
    }
}
