//! Name-keyed cache of circuit breakers.

use super::circuit_breaker::CircuitBreaker;
use super::config::CircuitBreakerConfig;
use super::state::State;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

/// Breakers keyed by resource name, created lazily on first access.
///
/// Pass the registry around explicitly (it is cheap to share behind an `Arc`);
/// there is no process-wide instance. Entries live until [`remove`](Self::remove).
///
/// The registry lock is never held while a breaker's own lock is taken:
/// aggregate operations copy the entries out first.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config: default_config,
        }
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Cached breaker for `name`, or a new one built from the default config.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_insert_with(name, || self.config.clone())
    }

    /// Like [`get`](Self::get) but builds a missing breaker from `config`.
    ///
    /// The config is fixed at first creation: when `name` is already cached the
    /// existing breaker is returned and `config` is ignored.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.get_or_insert_with(name, move || config)
    }

    fn get_or_insert_with<F>(&self, name: &str, make_config: F) -> Arc<CircuitBreaker>
    where
        F: FnOnce() -> CircuitBreakerConfig,
    {
        if let Some(breaker) = self.read().get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.write();
        // A concurrent caller may have created it between the two locks.
        if let Some(breaker) = breakers.get(name) {
            return Arc::clone(breaker);
        }

        let mut config = make_config();
        config.name = name.to_string();
        let breaker = CircuitBreaker::new(config);
        breakers.insert(name.to_string(), Arc::clone(&breaker));
        debug!(breaker = %name, "circuit breaker created");
        breaker
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.write().remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current phase of every registered breaker.
    pub fn states(&self) -> HashMap<String, State> {
        self.entries()
            .into_iter()
            .map(|(name, breaker)| (name, breaker.state()))
            .collect()
    }

    /// True when every registered breaker is closed. An empty registry is healthy.
    pub fn is_healthy(&self) -> bool {
        self.entries()
            .iter()
            .all(|(_, breaker)| breaker.state() == State::Closed)
    }

    pub fn reset_all(&self) {
        for (_, breaker) in self.entries() {
            breaker.reset();
        }
    }

    fn entries(&self) -> Vec<(String, Arc<CircuitBreaker>)> {
        self.read()
            .iter()
            .map(|(name, breaker)| (name.clone(), Arc::clone(breaker)))
            .collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<CircuitBreaker>>> {
        self.breakers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.list())
            .field("config", &self.config)
            .finish()
    }
}
