//! Bounded retry with exponential backoff for webhook deliveries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::forwarder::DeliveryOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per artifact, including the first. Never below 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Backoff before attempt `attempt + 1`, without jitter. `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Spread a delay by up to +25% so parallel relays do not retry in lockstep.
    fn jittered(&self, delay: Duration) -> Duration {
        let max_extra = delay.as_millis() as u64 / 4;
        if max_extra == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra))
    }

    /// Run `attempt` until it succeeds, fails for good, or attempts run out.
    /// The returned outcome carries the number of attempts made.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> DeliveryOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DeliveryOutcome>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut made = 1;
        loop {
            let mut outcome = attempt().await;
            outcome.attempts = made;

            let retryable = outcome.error.as_ref().is_some_and(|e| e.is_retryable());
            if !retryable || made >= max_attempts {
                return outcome;
            }

            let delay = self.jittered(self.delay_for(made));
            warn!(
                artifact = %outcome.kind,
                attempt = made,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying webhook delivery"
            );
            tokio::time::sleep(delay).await;
            made += 1;
        }
    }
}
