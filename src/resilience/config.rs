//! Circuit breaker configuration and injectable strategies.

use super::state::{Counts, State};
use crate::{Error, ErrorContext, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Called synchronously inside the transition, while the breaker's lock is held.
/// It must not call back into the same breaker.
pub type StateChangeFn = Arc<dyn Fn(&str, State, State) + Send + Sync>;

/// Classifies an outcome for breaker bookkeeping. `None` means the call returned `Ok`.
/// The caller still receives the original error regardless of the verdict.
pub type SuccessFn = Arc<dyn Fn(Option<&(dyn std::error::Error + 'static)>) -> bool + Send + Sync>;

/// Replaces the default trip decision entirely when configured.
pub type TripFn = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;

const DEFAULT_MAX_REQUESTS: u32 = 1;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;
const DEFAULT_FAILURE_RATIO: f64 = 0.5;
const DEFAULT_MIN_REQUESTS: u32 = 10;

#[derive(Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Probe requests admitted per half-open generation.
    pub max_requests: u32,
    /// Closed-state counter reset period; zero disables periodic resets.
    pub interval: Duration,
    /// How long the breaker stays open before probing.
    pub timeout: Duration,
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
    /// Failure ratio that trips a closed breaker once `min_requests` is reached.
    pub failure_ratio: f64,
    /// Sample size required before ratio tripping applies; zero disables it.
    pub min_requests: u32,
    /// Upper bound on how long `execute` waits for the protected call.
    pub call_timeout: Option<Duration>,
    pub on_state_change: Option<StateChangeFn>,
    pub is_successful: Option<SuccessFn>,
    pub should_trip: Option<TripFn>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_requests: DEFAULT_MAX_REQUESTS,
            interval: Duration::ZERO,
            timeout: DEFAULT_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            failure_ratio: DEFAULT_FAILURE_RATIO,
            min_requests: DEFAULT_MIN_REQUESTS,
            call_timeout: None,
            on_state_change: None,
            is_successful: None,
            should_trip: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("failure_ratio", &self.failure_ratio)
            .field("min_requests", &self.min_requests)
            .field("call_timeout", &self.call_timeout)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("is_successful", &self.is_successful.is_some())
            .field("should_trip", &self.should_trip.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_requests(mut self, max_requests: u32) -> Self {
        self.max_requests = max_requests;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the ratio threshold and the sample size it needs.
    pub fn with_failure_ratio(mut self, ratio: f64, min_requests: u32) -> Self {
        self.failure_ratio = ratio;
        self.min_requests = min_requests;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, State, State) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn with_is_successful<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&(dyn std::error::Error + 'static)>) -> bool + Send + Sync + 'static,
    {
        self.is_successful = Some(Arc::new(f));
        self
    }

    pub fn with_should_trip<F>(mut self, f: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.should_trip = Some(Arc::new(f));
        self
    }

    /// Check values that cannot be normalized into something meaningful.
    pub fn validate(&self) -> Result<()> {
        if !self.failure_ratio.is_finite() || !(0.0..=1.0).contains(&self.failure_ratio) {
            return Err(Error::validation_with_context(
                "failure ratio must be within 0.0..=1.0",
                ErrorContext::new()
                    .with_field_path("failure_ratio")
                    .with_details(format!("got {}", self.failure_ratio))
                    .with_source("circuit_breaker_config"),
            ));
        }
        Ok(())
    }

    /// Replace zero values with defaults, the way a freshly built breaker sees them.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_requests == 0 {
            self.max_requests = DEFAULT_MAX_REQUESTS;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        if self.failure_threshold == 0 {
            self.failure_threshold = DEFAULT_FAILURE_THRESHOLD;
        }
        if self.success_threshold == 0 {
            self.success_threshold = DEFAULT_SUCCESS_THRESHOLD;
        }
        self
    }

    pub(crate) fn classify(&self, err: Option<&(dyn std::error::Error + 'static)>) -> bool {
        match &self.is_successful {
            Some(f) => f(err),
            None => err.is_none(),
        }
    }
}
