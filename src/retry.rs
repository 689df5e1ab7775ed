use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StageError;

/// Bounded exponential backoff applied by stages that talk to the network.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Upper bound accepted for `retry.max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is spent. The returned error carries the number
/// of attempts made.
pub fn retry_transient<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation: &str,
    mut op: F,
) -> Result<Retried<T>, StageError>
where
    F: FnMut(u32) -> Result<T, StageError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(err) if err.kind.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, retrying"
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
            Err(mut err) => {
                if err.kind.is_retryable() {
                    err.message = format!(
                        "{} (gave up after {attempt} attempt(s))",
                        err.message
                    );
                }
                return Err(err.with_attempts(attempt));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 100,
            multiplier: 2.0,
            max_backoff_ms: 300,
        }
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(30), Duration::from_millis(300));
    }

    #[test]
    fn transient_failures_are_retried_until_success() {
        let sleeper = RecordingSleeper::default();
        let result = retry_transient(&policy(), &sleeper, "install", |attempt| {
            if attempt < 3 {
                Err(StageError::transient("connection reset"))
            } else {
                Ok("done")
            }
        })
        .unwrap();
        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let sleeper = RecordingSleeper::default();
        let err = retry_transient::<(), _>(&policy(), &sleeper, "install", |_| {
            Err(StageError::tool("exit status 1"))
        })
        .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[test]
    fn exhausted_budget_reports_attempts() {
        let sleeper = RecordingSleeper::default();
        let err = retry_transient::<(), _>(&policy(), &sleeper, "publish", |_| {
            Err(StageError::transient("timed out"))
        })
        .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert!(err.message.contains("gave up after 4 attempt(s)"));
        assert_eq!(sleeper.delays.lock().unwrap().len(), 3);
    }
}
