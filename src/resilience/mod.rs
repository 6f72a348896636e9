//! # Resilience Primitives Module
//!
//! Circuit breakers that protect calls to unreliable third-party providers by
//! tracking recent outcomes per resource and failing fast while a resource is
//! judged unhealthy.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`State`] / [`Counts`] | Breaker phase and per-generation request tally |
//! | [`CircuitBreaker`] | Thread-safe state machine guarding one resource |
//! | [`CircuitBreakerRegistry`] | Name-keyed breaker cache with lazy creation |
//! | [`CircuitBreakerWithMetrics`] | Decorator with lifetime totals and open-time tracking |
//! | [`TwoLevelCircuitBreaker`] | Service-wide breaker over per-operation breakers |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: failure threshold or ratio exceeded, requests fail fast
//! - **Half-Open**: a bounded number of probes test whether the resource recovered
//!
//! ```text
//! Closed   --should_trip-------------------------> Open
//! Open     --timeout elapsed---------------------> HalfOpen
//! HalfOpen --success_threshold consecutive wins--> Closed
//! HalfOpen --any failure-------------------------> Open
//! Closed   --interval elapsed--------------------> Closed (counts reset)
//! ```
//!
//! ```rust,no_run
//! use provider_breaker::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # #[derive(Debug, thiserror::Error)]
//! # #[error("smtp error")]
//! # struct SmtpError;
//! # async fn send_email() -> Result<(), SmtpError> { Ok(()) }
//! # async fn run() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_name("smtp")
//!         .with_failure_threshold(5)
//!         .with_timeout(Duration::from_secs(30)),
//! );
//!
//! match breaker.execute(send_email).await {
//!     Ok(()) => {}
//!     Err(e) if e.is_circuit_open() => { /* try the next provider */ }
//!     Err(e) => eprintln!("delivery failed: {e}"),
//! }
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod registry;
pub mod state;
pub mod two_level;

pub use circuit_breaker::CircuitBreaker;
pub use config::{CircuitBreakerConfig, StateChangeFn, SuccessFn, TripFn};
pub use metrics::{CircuitBreakerMetrics, CircuitBreakerWithMetrics};
pub use registry::CircuitBreakerRegistry;
pub use state::{Counts, State};
pub use two_level::TwoLevelCircuitBreaker;
