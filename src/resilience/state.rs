//! Breaker phase and per-generation request tally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a circuit breaker. The machine is cyclic; there is no terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum State {
    /// Requests pass through.
    #[default]
    Closed,
    /// Requests are rejected until the open timeout elapses.
    Open,
    /// A limited number of probe requests test whether the resource recovered.
    HalfOpen,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request counts for the current generation.
///
/// A generation starts on every phase change and every closed-state interval
/// rollover; all fields are zeroed at that point. Bumping one consecutive counter
/// always zeroes the other.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
}

impl Counts {
    pub(crate) fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    pub(crate) fn on_success(&mut self, at: DateTime<Utc>) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
        self.last_success = Some(at);
    }

    pub(crate) fn on_failure(&mut self, at: DateTime<Utc>) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
        self.last_failure = Some(at);
    }

    pub(crate) fn clear(&mut self) {
        *self = Counts::default();
    }

    /// `total_failures / requests`, or 0 before any request was counted.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.total_failures as f64 / self.requests as f64
    }

    /// True when every counter is zero and no timestamps are recorded.
    pub fn is_zero(&self) -> bool {
        *self == Counts::default()
    }
}
