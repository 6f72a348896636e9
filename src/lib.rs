//! # provider-breaker
//!
//! Circuit breakers for notification delivery: isolate failing third-party
//! providers (email, SMS, push, chat, webhooks) so that a provider that is down
//! fails fast instead of tying up workers, and probe it again after a cooldown.
//!
//! ## Overview
//!
//! Every protected resource gets a [`CircuitBreaker`] that counts recent outcomes
//! and moves between three phases:
//!
//! - **Closed**: calls pass through and are counted
//! - **Open**: calls are rejected with [`CallError::CircuitOpen`] until the timeout elapses
//! - **Half-Open**: a bounded number of probe calls decide whether to close again
//!
//! On top of the core breaker the crate offers a name-keyed
//! [`CircuitBreakerRegistry`], a [`TwoLevelCircuitBreaker`] (service-wide breaker
//! over per-operation breakers), a [`CircuitBreakerWithMetrics`] decorator and a
//! [`ProviderCircuitBreaker`] facade preconfigured for notification providers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use provider_breaker::{CallError, ProviderCircuitBreaker};
//!
//! #[derive(Debug, thiserror::Error)]
//! #[error("sendgrid returned {0}")]
//! struct SendgridError(u16);
//!
//! async fn deliver() -> Result<(), SendgridError> {
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let sendgrid = ProviderCircuitBreaker::new("sendgrid");
//!
//!     match sendgrid.execute(deliver).await {
//!         Ok(()) => println!("sent"),
//!         Err(CallError::CircuitOpen) => println!("sendgrid unavailable, falling back"),
//!         Err(e) => println!("delivery failed: {e}"),
//!     }
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Breaker state machine, registry, two-level breaker, metrics decorator |
//! | [`facade`] | Provider-oriented breaker with notification defaults |
//! | [`settings`] | YAML/JSON-loadable breaker settings |
//! | [`telemetry`] | State-transition sinks and tracing bootstrap |
//! | [`error`] | Crate error and call outcome types |

pub mod error;
pub mod facade;
pub mod resilience;
pub mod settings;
pub mod telemetry;

pub use error::{CallError, Error, ErrorContext};
pub use facade::provider::ProviderCircuitBreaker;
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitBreakerRegistry,
    CircuitBreakerWithMetrics, Counts, State, TwoLevelCircuitBreaker,
};
pub use settings::{BreakerSettings, ResilienceSettings};

/// Result type alias for configuration and settings operations.
pub type Result<T> = std::result::Result<T, Error>;
