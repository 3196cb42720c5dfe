/*!
 * Request retry with backoff
 *
 * Retries are driven by `VaultError::is_retryable`. Waits between attempts go
 * through the client gate, so a disabled client stops retrying at once.
 */

use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::gate::ClientGate;
use crate::config::{BackoffStrategy, ClientConfig};
use crate::error::Result;

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Initial delay before first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Backoff strategy to use
    pub backoff: BackoffStrategy,

    /// Jitter factor (0.0-1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl RetryPolicy {
    /// Policy described by the client configuration
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            backoff: config.backoff,
            jitter_factor: config.jitter_factor,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay before retry number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_delay = match self.backoff {
            BackoffStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential | BackoffStrategy::ExponentialWithJitter => {
                let multiplier = 2_u32.saturating_pow(attempt - 1);
                self.initial_delay.saturating_mul(multiplier)
            }
            BackoffStrategy::Fixed => self.initial_delay,
        };

        let capped_delay = base_delay.min(self.max_delay);

        if matches!(self.backoff, BackoffStrategy::ExponentialWithJitter) && self.jitter_factor > 0.0
        {
            let jitter = rand::rng().random_range(0.0..self.jitter_factor);
            let jitter_amount = capped_delay.as_secs_f64() * jitter;
            capped_delay + Duration::from_secs_f64(jitter_amount)
        } else {
            capped_delay
        }
    }
}

/// Execute an operation with retry logic
///
/// The gate is checked before every attempt; a closed gate fails with
/// `ClientDisabled` without calling `operation`.
pub fn with_retry<F, T>(policy: &RetryPolicy, gate: &ClientGate, mut operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;

    loop {
        gate.check()?;

        match operation() {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= policy.max_retries || !e.is_retryable() {
                    return Err(e);
                }
                attempt += 1;

                let delay = policy.calculate_delay(attempt);
                warn!(
                    "Retryable failure ({}), retry {}/{} in {:?}",
                    e.code(),
                    attempt,
                    policy.max_retries,
                    delay
                );
                gate.sleep(delay)?;
                debug!("Retrying after {:?}", delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::thread;
    use std::time::Instant;

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_delay_calculation() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.0,
            max_retries: 3,
        };

        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Exponential,
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            max_retries: 3,
        };
        assert_eq!(policy.calculate_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::Linear,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            max_retries: 3,
        };
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(3), Duration::from_millis(300));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            backoff: BackoffStrategy::ExponentialWithJitter,
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.5,
            max_retries: 3,
        };
        for _ in 0..20 {
            let delay = policy.calculate_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_retries_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick_policy(3), &ClientGate::new(), || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(VaultError::Network("reset".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&quick_policy(2), &ClientGate::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VaultError::service(503, "ServiceUnavailable", "busy"))
        });
        assert_eq!(result.unwrap_err().code(), "ServiceUnavailable");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&quick_policy(5), &ClientGate::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(VaultError::service(404, "NoSuchKey", "gone"))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_gate_skips_operation() {
        let gate = ClientGate::new();
        gate.disable();
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&quick_policy(5), &gate, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(result.unwrap_err().code(), "ClientDisabled");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disable_interrupts_backoff() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            backoff: BackoffStrategy::Fixed,
            jitter_factor: 0.0,
        };
        let gate = ClientGate::new();
        let disabler = gate.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            disabler.disable();
        });

        let start = Instant::now();
        let result: Result<()> =
            with_retry(&policy, &gate, || Err(VaultError::Network("timeout".into())));
        assert_eq!(result.unwrap_err().code(), "ClientDisabled");
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
