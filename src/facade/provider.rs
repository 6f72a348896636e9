use crate::resilience::{
    CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerWithMetrics, Counts, State,
};
use crate::CallError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Circuit breaker for one third-party notification provider.
///
/// Defaults are tuned for HTTP providers: three half-open probes, a 30s cooldown,
/// two successful probes to recover, and closed-state counters that reset every 10s.
/// Transitions are logged through `tracing` under the breaker name `provider:<id>`.
///
/// Callers choosing among several providers check [`is_available`](Self::is_available)
/// to skip one that is known to be down, and treat [`CallError::CircuitOpen`] as
/// "try the next provider".
pub struct ProviderCircuitBreaker {
    breaker: CircuitBreakerWithMetrics,
    provider: String,
}

impl ProviderCircuitBreaker {
    pub fn new(provider: impl Into<String>) -> Self {
        let provider = provider.into();
        let config = Self::provider_config(&provider);
        Self::with_config(provider, config)
    }

    /// Build with an explicit config, e.g. one produced from
    /// [`ResilienceSettings`](crate::settings::ResilienceSettings).
    /// The breaker name is always `provider:<id>`.
    pub fn with_config(provider: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let provider = provider.into();
        let config = config.with_name(breaker_name(&provider));
        Self {
            breaker: CircuitBreakerWithMetrics::new(config),
            provider,
        }
    }

    /// Default breaker config for `provider`.
    pub fn provider_config(provider: &str) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_name(breaker_name(provider))
            .with_max_requests(3)
            .with_timeout(Duration::from_secs(30))
            .with_failure_threshold(5)
            .with_success_threshold(2)
            .with_failure_ratio(0.5, 10)
            .with_interval(Duration::from_secs(10))
    }

    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        self.breaker.execute(f).await
    }

    /// Like [`execute`](Self::execute), handing `f` a child of `cancel`.
    pub async fn execute_with_cancel<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        self.breaker.execute_with_cancel(cancel, f).await
    }

    pub fn state(&self) -> State {
        self.breaker.state()
    }

    /// True unless the breaker is open. Never blocks on the protected call.
    pub fn is_available(&self) -> bool {
        self.state() != State::Open
    }

    pub fn counts(&self) -> Counts {
        self.breaker.counts()
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.breaker.metrics()
    }

    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Breaker name, `provider:<id>`.
    pub fn name(&self) -> &str {
        self.breaker.name()
    }
}

impl std::fmt::Debug for ProviderCircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCircuitBreaker")
            .field("provider", &self.provider)
            .field("state", &self.state())
            .finish()
    }
}

fn breaker_name(provider: &str) -> String {
    format!("provider:{provider}")
}
