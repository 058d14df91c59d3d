//! Bounded connect retries.

use std::future::Future;
use std::time::Duration;

use patchconf::ReconcileConfig;
use tracing::debug;

/// Initial delay, fixed interval and attempt cap for a retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait before the first attempt.
    pub first_wait: Duration,
    /// Wait between subsequent attempts.
    pub base_interval: Duration,
    /// Attempts before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            first_wait: Duration::from_millis(500),
            base_interval: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl From<&ReconcileConfig> for RetryPolicy {
    fn from(config: &ReconcileConfig) -> Self {
        Self {
            first_wait: Duration::from_millis(config.first_wait_ms),
            base_interval: Duration::from_millis(config.base_interval_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl RetryPolicy {
    pub fn with_first_wait(mut self, first_wait: Duration) -> Self {
        self.first_wait = first_wait;
        self
    }

    pub fn with_base_interval(mut self, base_interval: Duration) -> Self {
        self.base_interval = base_interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Upper bound on the time spent waiting: `first_wait + base_interval × max_attempts`.
    pub fn deadline(&self) -> Duration {
        self.first_wait + self.base_interval * self.max_attempts
    }

    /// Delay before attempt `attempt` (1-based).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            self.first_wait
        } else {
            self.base_interval
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    Succeeded,
    /// Worth trying again.
    Failed(String),
    /// Preconditions no longer hold; stop without counting as a failure.
    Abandoned,
}

/// How a retried operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded { attempts: u32 },
    GaveUp { attempts: u32 },
    Abandoned { attempts: u32 },
}

/// Run `attempt` until it succeeds, is abandoned, or the cap is reached.
///
/// Cancellation is by dropping the returned future.
pub async fn retry<F, Fut>(policy: &RetryPolicy, mut attempt: F) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt>,
{
    for n in 1..=policy.max_attempts {
        tokio::time::sleep(policy.delay_before(n)).await;

        match attempt(n).await {
            Attempt::Succeeded => return RetryOutcome::Succeeded { attempts: n },
            Attempt::Abandoned => return RetryOutcome::Abandoned { attempts: n },
            Attempt::Failed(reason) => {
                debug!(attempt = n, max = policy.max_attempts, "attempt failed: {}", reason);
            }
        }
    }

    RetryOutcome::GaveUp {
        attempts: policy.max_attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_first_wait(Duration::from_millis(100))
            .with_base_interval(Duration::from_millis(200))
            .with_max_attempts(3)
    }

    #[test]
    fn test_deadline() {
        assert_eq!(policy().deadline(), Duration::from_millis(700));
        assert_eq!(RetryPolicy::default().deadline(), Duration::from_millis(5500));
    }

    #[test]
    fn test_from_config() {
        let config = ReconcileConfig {
            first_wait_ms: 10,
            base_interval_ms: 20,
            max_attempts: 2,
            ..ReconcileConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.first_wait, Duration::from_millis(10));
        assert_eq!(policy.deadline(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let outcome = retry(&policy(), |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Attempt::Failed("not yet".into())
                } else {
                    Attempt::Succeeded
                }
            }
        })
        .await;

        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_within_deadline() {
        let p = policy();
        let start = Instant::now();

        let outcome = retry(&p, |_| async { Attempt::Failed("refused".into()) }).await;

        assert_eq!(outcome, RetryOutcome::GaveUp { attempts: 3 });
        assert!(start.elapsed() <= p.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_stops_early() {
        let calls = AtomicU32::new(0);
        let outcome = retry(&policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Abandoned }
        })
        .await;

        assert_eq!(outcome, RetryOutcome::Abandoned { attempts: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_gives_up_immediately() {
        let outcome = retry(&policy().with_max_attempts(0), |_| async {
            Attempt::Succeeded
        })
        .await;
        assert_eq!(outcome, RetryOutcome::GaveUp { attempts: 0 });
    }
}
