use super::config::CircuitBreakerConfig;
use super::state::{Counts, State};
use crate::CallError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct Inner {
    state: State,
    counts: Counts,
    /// Bumped on every new generation; outcomes from an older one are dropped.
    generation: u64,
    /// End of the current generation: open timeout, or closed-state interval.
    /// `None` never expires.
    expiry: Option<Instant>,
    last_failure: Option<DateTime<Utc>>,
}

/// Circuit breaker guarding one resource.
///
/// - Closed: every call is admitted and counted
/// - Open: calls fail fast with [`CallError::CircuitOpen`] until `timeout` elapses
/// - Half-Open: up to `max_requests` probes; `success_threshold` consecutive
///   successes close the circuit, any failure reopens it
///
/// All mutation happens under one `RwLock`. Time-based transitions (open timeout,
/// closed-state interval rollover) are evaluated lazily by the same routine whether
/// triggered from [`CircuitBreaker::state`] or from the background interval ticker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    /// Build a breaker. Zero-valued settings are replaced with defaults.
    ///
    /// The config is not validated here; an invalid `failure_ratio` is logged and
    /// leaves ratio tripping inert. Settings loaded through
    /// [`ResilienceSettings`](crate::settings::ResilienceSettings) are validated on load.
    ///
    /// When `interval` is non-zero and a Tokio runtime is available, a background
    /// ticker clears closed-state counts at interval boundaries. The ticker holds
    /// only a weak reference and exits once the breaker is dropped.
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        let config = config.normalized();
        if let Err(err) = config.validate() {
            warn!(breaker = %config.name, error = %err, "invalid circuit breaker config");
        }
        let interval = config.interval;
        let expiry = if interval.is_zero() {
            None
        } else {
            Instant::now().checked_add(interval)
        };

        let breaker = Arc::new(Self {
            config,
            inner: RwLock::new(Inner {
                state: State::Closed,
                counts: Counts::default(),
                generation: 0,
                expiry,
                last_failure: None,
            }),
        });

        if !interval.is_zero() {
            Self::spawn_interval_cleaner(&breaker);
        }
        breaker
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current phase, after applying any transition that is due.
    pub fn state(&self) -> State {
        {
            let inner = self.read();
            if !self.transition_due(&inner, Instant::now()) {
                return inner.state;
            }
        }
        // Re-checked under the write lock; another caller may have moved first.
        let mut inner = self.write();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    /// Copy of the current generation's counts.
    pub fn counts(&self) -> Counts {
        self.read().counts.clone()
    }

    /// Time of the most recent failure. Unlike [`Counts`], survives generation resets.
    pub fn last_failure(&self) -> Option<DateTime<Utc>> {
        self.read().last_failure
    }

    /// Force the breaker closed and start a fresh generation.
    pub fn reset(&self) {
        let mut inner = self.write();
        let now = Instant::now();
        if inner.state == State::Closed {
            self.new_generation(&mut inner, now);
        } else {
            self.set_state(&mut inner, State::Closed, now);
        }
    }

    /// Run `f` through the breaker.
    ///
    /// `f`'s future runs on its own Tokio task. The original error is returned
    /// unchanged in [`CallError::Inner`].
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

    /// Run `f` through the breaker, giving up on waiting when `cancel` fires.
    ///
    /// `f` receives a child of `cancel` and should honor it. Cancellation (and the
    /// per-call timeout) only stops the *wait*: the spawned task keeps running to
    /// completion and its result is discarded. The cancellation itself is recorded
    /// as the call's outcome.
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
        let Some(generation) = self.before_request() else {
            debug!(breaker = %self.config.name, "request rejected, circuit open");
            return Err(CallError::CircuitOpen);
        };

        let task = tokio::spawn(f(cancel.child_token()));
        let outcome = self.wait_for(cancel, task).await;
        self.record_result(generation, &outcome);
        outcome
    }

    /// Like [`execute`](Self::execute), but a [`CallError::CircuitOpen`] rejection
    /// is handed to `fallback` instead of being returned.
    pub async fn execute_with_fallback<F, Fut, T, E, G, GFut>(
        &self,
        f: F,
        fallback: G,
    ) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::error::Error + Send + 'static,
        G: FnOnce(CallError<E>) -> GFut,
        GFut: Future<Output = Result<T, CallError<E>>>,
    {
        match self.execute(f).await {
            Err(err) if err.is_circuit_open() => fallback(err).await,
            other => other,
        }
    }

    async fn wait_for<T, E>(
        &self,
        cancel: &CancellationToken,
        task: JoinHandle<Result<T, E>>,
    ) -> Result<T, CallError<E>> {
        let call_timeout = self.config.call_timeout;
        // Dropping the JoinHandle detaches the task; it is never aborted.
        let joined = async move {
            match call_timeout {
                Some(limit) => match tokio::time::timeout(limit, task).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => Err(CallError::Timeout),
                },
                None => flatten(task.await),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CallError::Cancelled),
            outcome = joined => outcome,
        };

        match &outcome {
            Err(CallError::Cancelled) => {
                debug!(breaker = %self.config.name, "stopped waiting, call cancelled")
            }
            Err(CallError::Timeout) => {
                debug!(breaker = %self.config.name, "stopped waiting, call timed out")
            }
            _ => {}
        }
        outcome
    }

    /// Admission gate. Returns the admitting generation, or `None` when the call
    /// must be rejected.
    pub(crate) fn before_request(&self) -> Option<u64> {
        let mut inner = self.write();
        self.advance(&mut inner, Instant::now());

        match inner.state {
            State::Closed => {}
            State::Open => return None,
            State::HalfOpen => {
                if inner.counts.requests >= self.config.max_requests {
                    return None;
                }
            }
        }
        inner.counts.on_request();
        Some(inner.generation)
    }

    /// Outcome bookkeeping for a call admitted by [`before_request`](Self::before_request).
    /// Ignored when the breaker has moved to a new generation since admission.
    pub(crate) fn record_result<T, E>(&self, generation: u64, outcome: &Result<T, CallError<E>>)
    where
        E: std::error::Error + 'static,
    {
        let success = self.config.classify(outcome_error(outcome));
        self.after_request(Some(generation), success);
    }

    /// Count a request that was admitted elsewhere and record its outcome
    /// against the current generation.
    pub(crate) fn observe_result<T, E>(&self, outcome: &Result<T, CallError<E>>)
    where
        E: std::error::Error + 'static,
    {
        let success = self.config.classify(outcome_error(outcome));
        self.after_request(None, success);
    }

    fn after_request(&self, admitted: Option<u64>, success: bool) {
        let mut inner = self.write();
        let now = Instant::now();
        self.advance(&mut inner, now);
        match admitted {
            Some(generation) if generation != inner.generation => {
                debug!(
                    breaker = %self.config.name,
                    generation,
                    current = inner.generation,
                    "outcome from an earlier generation dropped"
                );
                return;
            }
            Some(_) => {}
            None => inner.counts.on_request(),
        }
        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    fn on_success(&self, inner: &mut Inner, now: Instant) {
        inner.counts.on_success(Utc::now());

        if inner.state == State::HalfOpen
            && inner.counts.consecutive_successes >= self.config.success_threshold
        {
            self.set_state(inner, State::Closed, now);
        }
    }

    fn on_failure(&self, inner: &mut Inner, now: Instant) {
        let at = Utc::now();
        inner.counts.on_failure(at);
        inner.last_failure = Some(at);

        match inner.state {
            State::Closed => {
                if self.should_trip(&inner.counts) {
                    self.set_state(inner, State::Open, now);
                }
            }
            State::HalfOpen => self.set_state(inner, State::Open, now),
            State::Open => {}
        }
    }

    fn should_trip(&self, counts: &Counts) -> bool {
        if let Some(should_trip) = &self.config.should_trip {
            return should_trip(counts);
        }

        if counts.consecutive_failures >= self.config.failure_threshold {
            return true;
        }

        self.config.min_requests > 0
            && counts.requests >= self.config.min_requests
            && counts.failure_ratio() >= self.config.failure_ratio
    }

    fn transition_due(&self, inner: &Inner, now: Instant) -> bool {
        match inner.state {
            State::Closed => {
                !self.config.interval.is_zero() && inner.expiry.map_or(false, |e| now >= e)
            }
            State::Open => inner.expiry.map_or(false, |e| now >= e),
            State::HalfOpen => false,
        }
    }

    /// Apply whichever time-based transition is due. Write lock held by the caller.
    fn advance(&self, inner: &mut Inner, now: Instant) {
        if !self.transition_due(inner, now) {
            return;
        }
        match inner.state {
            State::Closed => {
                debug!(breaker = %self.config.name, "interval elapsed, counts reset");
                self.new_generation(inner, now);
            }
            State::Open => self.set_state(inner, State::HalfOpen, now),
            State::HalfOpen => {}
        }
    }

    fn set_state(&self, inner: &mut Inner, to: State, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);

        if to == State::Open {
            warn!(breaker = %self.config.name, %from, %to, "circuit breaker opened");
        } else {
            info!(breaker = %self.config.name, %from, %to, "circuit breaker state changed");
        }

        if let Some(on_change) = &self.config.on_state_change {
            let name = self.config.name.as_str();
            if catch_unwind(AssertUnwindSafe(|| on_change(name, from, to))).is_err() {
                error!(
                    breaker = %self.config.name,
                    %from,
                    %to,
                    "state change callback panicked; transition kept"
                );
            }
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts.clear();
        // An unrepresentable deadline means the generation never expires.
        inner.expiry = match inner.state {
            State::Closed if !self.config.interval.is_zero() => {
                now.checked_add(self.config.interval)
            }
            State::Closed | State::HalfOpen => None,
            State::Open => now.checked_add(self.config.timeout),
        };
    }

    /// Entry point for the background ticker; same routine as [`state`](Self::state).
    fn refresh(&self) {
        let mut inner = self.write();
        self.advance(&mut inner, Instant::now());
    }

    fn spawn_interval_cleaner(breaker: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(
                breaker = %breaker.config.name,
                "no tokio runtime, interval resets happen on state reads only"
            );
            return;
        };

        let period = breaker.config.interval;
        let Some(start) = tokio::time::Instant::now().checked_add(period) else {
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(breaker);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(breaker) => breaker.refresh(),
                    None => break,
                }
            }
        });
    }

    // Every critical section leaves `Inner` consistent, so a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.read();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &inner.state)
            .field("counts", &inner.counts)
            .finish()
    }
}

fn flatten<T, E>(joined: Result<Result<T, E>, JoinError>) -> Result<T, CallError<E>> {
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Inner(e)),
        Err(join_err) => Err(CallError::Aborted(join_err.to_string())),
    }
}

pub(crate) fn outcome_error<T, E>(outcome: &Result<T, CallError<E>>) -> Option<&(dyn std::error::Error + 'static)>
where
    E: std::error::Error + 'static,
{
    match outcome {
        Ok(_) => None,
        Err(CallError::Inner(e)) => Some(e as &(dyn std::error::Error + 'static)),
        Err(other) => Some(other as &(dyn std::error::Error + 'static)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Debug, thiserror::Error)]
    #[error("provider unavailable")]
    struct ProviderDown;

    #[derive(Debug, thiserror::Error)]
    #[error("recipient rejected")]
    struct RecipientRejected;

    async fn fail(cb: &CircuitBreaker) -> Result<(), CallError<ProviderDown>> {
        cb.execute(|| async { Err::<(), _>(ProviderDown) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<(), CallError<ProviderDown>> {
        cb.execute(|| async { Ok::<_, ProviderDown>(()) }).await
    }

    fn record_failure(cb: &CircuitBreaker) {
        let generation = cb.before_request().expect("admitted");
        cb.record_result::<(), _>(generation, &Err(CallError::Inner(ProviderDown)));
    }

    fn record_success(cb: &CircuitBreaker) {
        let generation = cb.before_request().expect("admitted");
        cb.record_result::<(), ProviderDown>(generation, &Ok(()));
    }

    #[test]
    fn test_initial_state() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.counts().is_zero());
        assert!(cb.last_failure().is_none());
        assert_eq!(cb.name(), "default");
    }

    #[test]
    fn test_new_normalizes_config() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig {
            max_requests: 0,
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        });
        assert_eq!(cb.config().max_requests, 1);
        assert_eq!(cb.config().failure_threshold, 5);
    }

    #[tokio::test]
    async fn test_trips_after_consecutive_failures() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_timeout(Duration::from_secs(30)),
        );
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let result = cb
                .execute(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProviderDown)
                })
                .await;
            assert!(matches!(result, Err(CallError::Inner(ProviderDown))));
        }
        assert_eq!(cb.state(), State::Open);

        for _ in 0..5 {
            let calls = Arc::clone(&calls);
            let result = cb
                .execute(move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ProviderDown>(())
                })
                .await;
            assert!(result.unwrap_err().is_circuit_open());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(cb.last_failure().is_some());
    }

    #[tokio::test]
    async fn test_success_breaks_failure_streak() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_failure_ratio(0.5, 0),
        );
        for _ in 0..10 {
            let _ = fail(&cb).await;
            let _ = fail(&cb).await;
            let _ = succeed(&cb).await;
        }
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.counts().consecutive_failures, 0);
    }

    #[test]
    fn test_open_becomes_half_open_after_timeout() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::from_millis(200)),
        );
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(cb.state(), State::HalfOpen);
        // admission counter starts fresh at the transition
        assert_eq!(cb.counts().requests, 0);
    }

    #[tokio::test]
    async fn test_half_open_admits_at_most_max_requests() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_max_requests(2)
                .with_success_threshold(3)
                .with_timeout(Duration::from_millis(30)),
        );
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cb.state(), State::HalfOpen);

        assert!(succeed(&cb).await.is_ok());
        assert!(succeed(&cb).await.is_ok());
        assert!(succeed(&cb).await.unwrap_err().is_circuit_open());
        assert_eq!(cb.state(), State::HalfOpen);
        assert_eq!(cb.counts().consecutive_successes, 2);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens_immediately() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_max_requests(5)
                .with_success_threshold(3)
                .with_timeout(Duration::from_millis(200)),
        );
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(cb.state(), State::HalfOpen);

        assert!(succeed(&cb).await.is_ok());
        assert!(succeed(&cb).await.is_ok());
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), State::Open);

        // the open window restarted at the half-open failure
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cb.state(), State::Open);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cb.state(), State::HalfOpen);
    }

    #[tokio::test]
    async fn test_success_threshold_closes_and_zeroes_counts() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_max_requests(2)
                .with_success_threshold(2)
                .with_timeout(Duration::from_millis(30)),
        );
        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(succeed(&cb).await.is_ok());
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.counts().is_zero());
    }

    #[test]
    fn test_ratio_needs_min_requests() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_failure_ratio(0.5, 6),
        );
        // F S F S F: ratio 0.6 but only 5 requests, streak never reaches 3
        for i in 0..5 {
            if i % 2 == 0 {
                record_failure(&cb);
            } else {
                record_success(&cb);
            }
        }
        assert_eq!(cb.state(), State::Closed);

        // sixth request fails: 4/6 with min_requests met
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn test_zero_min_requests_disables_ratio() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(100)
                .with_failure_ratio(0.1, 0),
        );
        for _ in 0..20 {
            record_failure(&cb);
            record_success(&cb);
        }
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn test_custom_should_trip_replaces_default() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_should_trip(|counts| counts.total_failures >= 4),
        );
        for _ in 0..3 {
            record_failure(&cb);
        }
        assert_eq!(cb.state(), State::Closed);
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test]
    async fn test_is_successful_reclassifies_but_returns_error() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_is_successful(|err| err.map_or(true, |e| e.is::<RecipientRejected>())),
        );
        let result = cb
            .execute(|| async { Err::<(), _>(RecipientRejected) })
            .await;
        assert!(matches!(result, Err(CallError::Inner(RecipientRejected))));
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.counts().total_successes, 1);
    }

    #[test]
    fn test_interval_rollover_on_state_read() {
        // no runtime here, so no background ticker: rollover comes from state()
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(10)
                .with_interval(Duration::from_millis(200)),
        );
        record_failure(&cb);
        record_failure(&cb);
        assert_eq!(cb.counts().consecutive_failures, 2);

        thread::sleep(Duration::from_millis(250));
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.counts().is_zero());
    }

    #[tokio::test]
    async fn test_background_cleaner_resets_idle_breaker() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(10)
                .with_interval(Duration::from_millis(150)),
        );
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.counts().total_failures, 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        // counts() never evaluates transitions itself
        assert!(cb.counts().is_zero());
    }

    #[tokio::test]
    async fn test_cleaner_stops_when_breaker_dropped() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new().with_interval(Duration::from_millis(10)),
        );
        let weak = Arc::downgrade(&cb);
        drop(cb);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_waiting_not_work() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(5));
        let token = CancellationToken::new();
        let finished = Arc::new(AtomicBool::new(false));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let done = Arc::clone(&finished);
        let result = cb
            .execute_with_cancel(&token, move |_child| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                done.store(true, Ordering::SeqCst);
                Ok::<_, ProviderDown>(())
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(cb.counts().total_failures, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_child_token_reaches_protected_call() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        let token = CancellationToken::new();
        let observed = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&observed);
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let _ = cb
            .execute_with_cancel(&token, move |child| async move {
                child.cancelled().await;
                seen.store(true, Ordering::SeqCst);
                Ok::<_, ProviderDown>(())
            })
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_call_timeout_counts_as_failure() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_call_timeout(Duration::from_millis(20)),
        );
        let result = cb
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, ProviderDown>(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test]
    async fn test_panicking_call_is_a_failure() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(1));
        let result: Result<(), CallError<ProviderDown>> = cb
            .execute(|| async {
                if true {
                    panic!("adapter bug");
                }
                Ok::<(), ProviderDown>(())
            })
            .await;
        assert!(matches!(result, Err(CallError::Aborted(_))));
        assert_eq!(cb.state(), State::Open);
    }

    #[tokio::test]
    async fn test_fallback_only_on_circuit_open() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(1));

        let first = cb
            .execute_with_fallback(
                || async { Err::<&str, _>(ProviderDown) },
                |_| async { Ok("fallback") },
            )
            .await;
        assert!(matches!(first, Err(CallError::Inner(ProviderDown))));

        let second = cb
            .execute_with_fallback(
                || async { Ok::<_, ProviderDown>("primary") },
                |err| async move {
                    assert!(err.is_circuit_open());
                    Ok("fallback")
                },
            )
            .await;
        assert_eq!(second.unwrap(), "fallback");
    }

    #[test]
    fn test_reset_from_any_state() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(1));
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);

        cb.reset();
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.counts().is_zero());

        // already closed: still a fresh generation
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(5));
        record_failure(&cb);
        cb.reset();
        assert!(cb.counts().is_zero());
        assert!(cb.last_failure().is_some());
    }

    #[test]
    fn test_state_change_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_name("twilio")
                .with_failure_threshold(1)
                .with_timeout(Duration::from_millis(20))
                .with_on_state_change(move |name, from, to| {
                    sink.lock().unwrap().push((name.to_string(), from, to));
                }),
        );
        record_failure(&cb);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), State::HalfOpen);
        cb.reset();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("twilio".to_string(), State::Closed, State::Open),
                ("twilio".to_string(), State::Open, State::HalfOpen),
                ("twilio".to_string(), State::HalfOpen, State::Closed),
            ]
        );
    }

    #[test]
    fn test_panicking_callback_keeps_transition() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_on_state_change(|_, _, _| panic!("hook failed")),
        );
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);
        // lock is still usable afterwards
        cb.reset();
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn test_thread_safe_counting() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1000)
                .with_failure_ratio(0.5, 0),
        );
        let mut handles = vec![];
        for _ in 0..10 {
            let cb = Arc::clone(&cb);
            handles.push(thread::spawn(move || {
                for _ in 0..5 {
                    record_failure(&cb);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let counts = cb.counts();
        assert_eq!(counts.requests, 50);
        assert_eq!(counts.consecutive_failures, 50);
    }

    #[test]
    fn test_outcome_from_earlier_generation_is_dropped() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_max_requests(1)
                .with_success_threshold(1)
                .with_timeout(Duration::from_millis(20)),
        );
        let slow = cb.before_request().expect("admitted");
        record_failure(&cb);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(cb.state(), State::HalfOpen);

        // the late success was admitted while closed, not in half-open
        cb.record_result::<(), ProviderDown>(slow, &Ok(()));
        assert_eq!(cb.state(), State::HalfOpen);
        assert!(cb.counts().is_zero());

        // the single half-open slot is still free
        record_success(&cb);
        assert_eq!(cb.state(), State::Closed);
    }

    #[test]
    fn test_late_failure_does_not_reopen_after_reset() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(1));
        let slow = cb.before_request().expect("admitted");
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);
        cb.reset();

        cb.record_result::<(), _>(slow, &Err(CallError::Inner(ProviderDown)));
        assert_eq!(cb.state(), State::Closed);
        assert!(cb.counts().is_zero());
    }

    #[test]
    fn test_observed_outcome_ignores_generation() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(2));
        record_failure(&cb);
        cb.observe_result::<(), _>(&Err(CallError::Inner(ProviderDown)));
        assert_eq!(cb.state(), State::Open);
    }

    #[test]
    fn test_unbounded_timeout_stays_open_until_reset() {
        let transitions = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&transitions);
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(1)
                .with_timeout(Duration::MAX)
                .with_on_state_change(move |_, _, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );
        record_failure(&cb);
        assert_eq!(cb.state(), State::Open);
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
        assert!(cb.before_request().is_none());
        assert_eq!(cb.state(), State::Open);

        cb.reset();
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(transitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unbounded_interval_never_rolls_over() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(10)
                .with_interval(Duration::MAX),
        );
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), State::Closed);
        assert_eq!(cb.counts().total_failures, 2);
    }

    #[test]
    fn test_invalid_ratio_from_builder_does_not_trip() {
        let cb = CircuitBreaker::new(
            CircuitBreakerConfig::new()
                .with_failure_threshold(100)
                .with_failure_ratio(f64::NAN, 1),
        );
        assert!(cb.config().validate().is_err());
        for _ in 0..5 {
            record_failure(&cb);
        }
        assert_eq!(cb.state(), State::Closed);
    }
}
