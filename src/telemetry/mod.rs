//! Telemetry for breaker state transitions.
//!
//! Breakers report transitions through their `on_state_change` strategy. This
//! module turns that callback into pluggable sinks and installs the default
//! `tracing` subscriber for binaries that do not bring their own.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TransitionEvent`] | One recorded phase change |
//! | [`TransitionSink`] | Trait for transition destinations |
//! | [`NoopTransitionSink`] | Discards everything |
//! | [`InMemoryTransitionSink`] | Bounded in-memory sink for tests and diagnostics |
//! | [`TracingTransitionSink`] | Emits one `tracing` event per transition |
//! | [`CompositeTransitionSink`] | Fans out to several sinks |
//!
//! Sinks run synchronously under the breaker's lock: keep `record` short and
//! never call back into the breaker that produced the event.

use crate::resilience::{State, StateChangeFn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub breaker: String,
    pub from: State,
    pub to: State,
    pub at: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(breaker: impl Into<String>, from: State, to: State) -> Self {
        Self {
            breaker: breaker.into(),
            from,
            to,
            at: Utc::now(),
        }
    }
}

/// Destination for transition events.
pub trait TransitionSink: Send + Sync {
    fn record(&self, event: &TransitionEvent);
}

/// No-op sink.
pub struct NoopTransitionSink;

impl TransitionSink for NoopTransitionSink {
    fn record(&self, _event: &TransitionEvent) {}
}

/// In-memory sink keeping the most recent `max_events` transitions.
pub struct InMemoryTransitionSink {
    events: Mutex<VecDeque<TransitionEvent>>,
    max_events: usize,
}

impl InMemoryTransitionSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events,
        }
    }

    pub fn events(&self) -> Vec<TransitionEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, breaker: &str) -> Vec<TransitionEvent> {
        self.lock()
            .iter()
            .filter(|e| e.breaker == breaker)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<TransitionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryTransitionSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TransitionSink for InMemoryTransitionSink {
    fn record(&self, event: &TransitionEvent) {
        if self.max_events == 0 {
            return;
        }
        let mut events = self.lock();
        if events.len() == self.max_events {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}

/// Emits each transition as a `tracing` event under the `provider_breaker::transition` target.
#[derive(Default)]
pub struct TracingTransitionSink;

impl TransitionSink for TracingTransitionSink {
    fn record(&self, event: &TransitionEvent) {
        if event.to == State::Open {
            warn!(
                target: "provider_breaker::transition",
                breaker = %event.breaker, from = %event.from, to = %event.to, at = %event.at,
                "circuit opened"
            );
        } else {
            info!(
                target: "provider_breaker::transition",
                breaker = %event.breaker, from = %event.from, to = %event.to, at = %event.at,
                "circuit state changed"
            );
        }
    }
}

/// Composite sink for multiple destinations.
#[derive(Default)]
pub struct CompositeTransitionSink {
    sinks: Vec<Arc<dyn TransitionSink>>,
}

impl CompositeTransitionSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn TransitionSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TransitionSink for CompositeTransitionSink {
    fn record(&self, event: &TransitionEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// Adapt a sink into an `on_state_change` strategy.
///
/// ```rust,no_run
/// use provider_breaker::telemetry::{on_state_change_from_sink, InMemoryTransitionSink};
/// use provider_breaker::CircuitBreakerConfig;
/// use std::sync::Arc;
///
/// let sink = Arc::new(InMemoryTransitionSink::default());
/// let mut config = CircuitBreakerConfig::new().with_name("sms");
/// config.on_state_change = Some(on_state_change_from_sink(sink.clone()));
/// ```
pub fn on_state_change_from_sink(sink: Arc<dyn TransitionSink>) -> StateChangeFn {
    Arc::new(move |name: &str, from: State, to: State| {
        sink.record(&TransitionEvent::new(name, from, to));
    })
}

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
