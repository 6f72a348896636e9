//! File-loadable breaker settings.
//!
//! Settings are plain data (no strategy closures) so they can live in YAML or JSON
//! next to the rest of a deployment's configuration:
//!
//! ```yaml
//! defaults:
//!   timeout_ms: 20000
//! providers:
//!   twilio:
//!     failure_threshold: 3
//!     call_timeout_ms: 5000
//!   sendgrid:
//!     failure_ratio: 0.3
//!     min_requests: 20
//! ```
//!
//! A provider's effective config is layered as provider defaults, then
//! `defaults`, then the provider's own entry.

use crate::facade::provider::ProviderCircuitBreaker;
use crate::resilience::CircuitBreakerConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Optional overrides for one breaker. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
}

impl BreakerSettings {
    /// Overlay the fields that are set onto `config`. Strategies are left untouched.
    pub fn apply_to(&self, mut config: CircuitBreakerConfig) -> CircuitBreakerConfig {
        if let Some(v) = self.max_requests {
            config.max_requests = v;
        }
        if let Some(ms) = self.interval_ms {
            config.interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = self.failure_threshold {
            config.failure_threshold = v;
        }
        if let Some(v) = self.success_threshold {
            config.success_threshold = v;
        }
        if let Some(v) = self.failure_ratio {
            config.failure_ratio = v;
        }
        if let Some(v) = self.min_requests {
            config.min_requests = v;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.call_timeout = Some(Duration::from_millis(ms));
        }
        config
    }

    fn validate(&self, field_path: &str) -> Result<()> {
        if let Some(ratio) = self.failure_ratio {
            if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
                return Err(Error::validation_with_context(
                    "failure ratio must be within 0.0..=1.0",
                    ErrorContext::new()
                        .with_field_path(format!("{field_path}.failure_ratio"))
                        .with_details(format!("got {ratio}"))
                        .with_source("resilience_settings"),
                ));
            }
        }
        if self.call_timeout_ms == Some(0) {
            return Err(Error::validation_with_context(
                "call timeout must be positive; omit it to wait indefinitely",
                ErrorContext::new()
                    .with_field_path(format!("{field_path}.call_timeout_ms"))
                    .with_source("resilience_settings"),
            ));
        }
        Ok(())
    }
}

/// Breaker settings for a set of providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceSettings {
    #[serde(default)]
    pub defaults: BreakerSettings,
    #[serde(default)]
    pub providers: BTreeMap<String, BreakerSettings>,
}

impl ResilienceSettings {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|s| s.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&content),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::from_yaml_str(&content)
            }
            other => Err(Error::configuration_with_context(
                "unsupported settings file format",
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_details(format!("extension {:?}, expected json, yaml or yml", other))
                    .with_source("resilience_settings"),
            )),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.defaults.validate("defaults")?;
        for (name, provider) in &self.providers {
            provider.validate(&format!("providers.{name}"))?;
        }
        Ok(())
    }

    /// Effective config for `provider`, starting from the provider defaults.
    pub fn provider_config(&self, provider: &str) -> CircuitBreakerConfig {
        let config = self
            .defaults
            .apply_to(ProviderCircuitBreaker::provider_config(provider));
        match self.providers.get(provider) {
            Some(overrides) => overrides.apply_to(config),
            None => config,
        }
    }

    /// A provider breaker built from [`provider_config`](Self::provider_config).
    pub fn provider_breaker(&self, provider: &str) -> ProviderCircuitBreaker {
        ProviderCircuitBreaker::with_config(provider, self.provider_config(provider))
    }
}
