//! Bounded retry for metastore and KMS calls.
//!
//! Only transient failures (`DependencyTimeout`, `Unavailable`) are retried.
//! Every other error returns on the first attempt. Retries stop after
//! `max_retries` extra attempts or once the next backoff would overrun the
//! dependency timeout, whichever comes first.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::KeystrataError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Total time budget across all attempts of one call.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2.0,
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = delay.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Run `op`, retrying transient failures. `what` names the dependency
    /// call in logs.
    pub fn run<T, F>(&self, what: &str, mut op: F) -> Result<T, KeystrataError>
    where
        F: FnMut() -> Result<T, KeystrataError>,
    {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for_attempt(attempt);
                    if started.elapsed() + delay > self.timeout {
                        warn!(call = what, attempt, error = %err, "dependency deadline exceeded");
                        return Err(KeystrataError::DependencyTimeout(format!(
                            "{what}: {err}"
                        )));
                    }
                    warn!(call = what, attempt, ?delay, error = %err, "retrying dependency call");
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            multiplier: 2.0,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = fast();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4));
        assert_eq!(policy.delay_for_attempt(9), Duration::from_millis(4));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast().run("metastore.load", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(KeystrataError::Unavailable("flaky".into()))
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn retries_are_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast().run("kms.decrypt", || {
            calls.set(calls.get() + 1);
            Err(KeystrataError::DependencyTimeout("slow".into()))
        });
        assert!(matches!(result, Err(KeystrataError::DependencyTimeout(_))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast().run("metastore.load", || {
            calls.set(calls.get() + 1);
            Err(KeystrataError::IntegrityCheckFailed)
        });
        assert!(matches!(result, Err(KeystrataError::IntegrityCheckFailed)));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhausted_deadline_is_a_timeout() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            timeout: Duration::from_millis(10),
            ..fast()
        };
        let calls = Cell::new(0);
        let result: Result<(), _> = policy.run("kms.encrypt", || {
            calls.set(calls.get() + 1);
            Err(KeystrataError::Unavailable("down".into()))
        });
        assert!(matches!(result, Err(KeystrataError::DependencyTimeout(_))));
        assert_eq!(calls.get(), 1);
    }
}
