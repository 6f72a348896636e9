//! Provider Failover Example
//!
//! Sends a batch of SMS notifications through a chain of providers, each guarded
//! by a `ProviderCircuitBreaker`. The primary provider fails on every call; once
//! its breaker opens the chain skips it without paying for another failed call,
//! and after the cooldown a probe lets it back in.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example provider_failover

use provider_breaker::telemetry::init_tracing;
use provider_breaker::{CallError, ProviderCircuitBreaker, ResilienceSettings};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("{provider} returned HTTP {status}")]
struct ProviderError {
    provider: String,
    status: u16,
}

struct SmsProvider {
    breaker: ProviderCircuitBreaker,
    healthy: Arc<AtomicBool>,
}

impl SmsProvider {
    async fn send(&self, to: &str) -> Result<(), CallError<ProviderError>> {
        let provider = self.breaker.provider().to_string();
        let healthy = self.healthy.load(Ordering::SeqCst);
        let to = to.to_string();
        self.breaker
            .execute(move || async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                if healthy {
                    println!("  {provider}: delivered to {to}");
                    Ok(())
                } else {
                    Err(ProviderError {
                        provider,
                        status: 503,
                    })
                }
            })
            .await
    }
}

async fn send_with_failover(chain: &[SmsProvider], to: &str) -> anyhow::Result<()> {
    for provider in chain {
        if !provider.breaker.is_available() {
            println!("  {}: skipped (circuit open)", provider.breaker.provider());
            continue;
        }
        match provider.send(to).await {
            Ok(()) => return Ok(()),
            Err(e) => println!("  {}: {e}", provider.breaker.provider()),
        }
    }
    anyhow::bail!("no provider could deliver to {to}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    println!("=== Provider Failover Demo ===\n");

    let settings = ResilienceSettings::from_yaml_str(
        r#"
defaults:
  timeout_ms: 500
providers:
  twilio:
    failure_threshold: 3
    success_threshold: 1
"#,
    )?;

    let twilio_up = Arc::new(AtomicBool::new(false));
    let chain = vec![
        SmsProvider {
            breaker: settings.provider_breaker("twilio"),
            healthy: Arc::clone(&twilio_up),
        },
        SmsProvider {
            breaker: settings.provider_breaker("vonage"),
            healthy: Arc::new(AtomicBool::new(true)),
        },
    ];

    println!("--- Primary down ---");
    for i in 0..6 {
        println!("message {i}:");
        send_with_failover(&chain, "+15550100").await?;
    }

    println!("\n--- Primary recovers ---");
    twilio_up.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    for i in 6..9 {
        println!("message {i}:");
        send_with_failover(&chain, "+15550100").await?;
    }

    println!("\n--- Metrics ---");
    for provider in &chain {
        println!("{}", serde_json::to_string_pretty(&provider.breaker.metrics())?);
    }
    Ok(())
}
