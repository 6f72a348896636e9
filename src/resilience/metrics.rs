//! Cumulative metrics around a circuit breaker.
//!
//! The breaker's own [`Counts`] are generation-scoped and vanish on every phase
//! change. The decorator here keeps totals for the breaker's whole life and
//! tracks how long it has spent open.

use super::circuit_breaker::{outcome_error, CircuitBreaker};
use super::config::CircuitBreakerConfig;
use super::state::{Counts, State};
use crate::CallError;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Read-only metrics view, computed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: State,
    /// Every call made through the decorator, rejections included.
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused while open; neither success nor failure.
    pub total_rejected: u64,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    /// Total time spent open, including the current open period. Serialized in milliseconds.
    #[serde(serialize_with = "serialize_millis")]
    pub open_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Failures over calls that reached the resource, or 0 when none did.
    pub fn failure_rate(&self) -> f64 {
        let reached = self.total_successes + self.total_failures;
        if reached == 0 {
            return 0.0;
        }
        self.total_failures as f64 / reached as f64
    }
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Default)]
struct OpenClock {
    opened_at: Option<Instant>,
    total_open: Duration,
}

#[derive(Debug, Default)]
struct Totals {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected: AtomicU64,
    open: Mutex<OpenClock>,
}

impl Totals {
    fn on_transition(&self, from: State, to: State) {
        let mut clock = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if to == State::Open {
            clock.opened_at = Some(now);
        } else if from == State::Open {
            if let Some(opened_at) = clock.opened_at.take() {
                clock.total_open += now.saturating_duration_since(opened_at);
            }
        }
    }

    fn open_duration(&self) -> Duration {
        let clock = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        clock.total_open + clock.opened_at.map_or(Duration::ZERO, |at| at.elapsed())
    }
}

/// A [`CircuitBreaker`] that also keeps lifetime totals and open-time accounting.
pub struct CircuitBreakerWithMetrics {
    breaker: Arc<CircuitBreaker>,
    totals: Arc<Totals>,
}

impl CircuitBreakerWithMetrics {
    /// Build the breaker, chaining open-time tracking in front of any
    /// `on_state_change` already present in `config`.
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        let totals = Arc::new(Totals::default());
        let original = config.on_state_change.take();
        let hook = Arc::clone(&totals);
        config.on_state_change = Some(Arc::new(move |name: &str, from: State, to: State| {
            hook.on_transition(from, to);
            if let Some(original) = &original {
                original(name, from, to);
            }
        }));

        Self {
            breaker: CircuitBreaker::new(config),
            totals,
        }
    }

    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        self.execute_with_cancel(&CancellationToken::new(), move |_| f())
            .await
    }

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
        self.totals.requests.fetch_add(1, Ordering::Relaxed);
        let outcome = self.breaker.execute_with_cancel(cancel, f).await;
        self.tally(&outcome);
        outcome
    }

    fn tally<T, E>(&self, outcome: &Result<T, CallError<E>>)
    where
        E: std::error::Error + 'static,
    {
        let counter = match outcome {
            Err(CallError::CircuitOpen) => &self.totals.rejected,
            _ if self.breaker.config().classify(outcome_error(outcome)) => &self.totals.successes,
            _ => &self.totals.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        // Evaluate due transitions first so an expired open period stops counting.
        let state = self.breaker.state();
        let counts = self.breaker.counts();

        CircuitBreakerMetrics {
            name: self.breaker.name().to_string(),
            state,
            total_requests: self.totals.requests.load(Ordering::Relaxed),
            total_successes: self.totals.successes.load(Ordering::Relaxed),
            total_failures: self.totals.failures.load(Ordering::Relaxed),
            total_rejected: self.totals.rejected.load(Ordering::Relaxed),
            consecutive_failures: counts.consecutive_failures,
            last_failure: self.breaker.last_failure(),
            open_duration: self.totals.open_duration(),
        }
    }

    pub fn name(&self) -> &str {
        self.breaker.name()
    }

    pub fn state(&self) -> State {
        self.breaker.state()
    }

    pub fn counts(&self) -> Counts {
        self.breaker.counts()
    }

    /// Reset the breaker. Lifetime totals are kept.
    pub fn reset(&self) {
        self.breaker.reset();
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}
