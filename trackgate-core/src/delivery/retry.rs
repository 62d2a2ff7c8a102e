//! Bounded exponential backoff around a fallible operation

use std::future::Future;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Result;
use crate::logging::{Log, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (0-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_millis() as f64;
        let scaled = initial * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Policy for the attempts left once `done` attempts have failed.
    ///
    /// Its delays continue the original schedule.
    pub fn remaining(&self, done: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.saturating_sub(done),
            initial_delay: self.delay_after(done),
            ..*self
        }
    }

    /// Every wait a fully failing run goes through, in order
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.delay_after(attempt))
            .collect()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.backoff_multiplier,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

/// Run `op` until it succeeds, fails non-recoverably, or runs out of
/// attempts. `op` receives the 0-based attempt number.
///
/// The last error is returned on exhaustion; queueing is up to the caller.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, log: &Log, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_recoverable() => {
                log.emit(
                    LogLevel::Debug,
                    "retry",
                    "non-recoverable error, not retrying",
                    vec![("error", e.to_string())],
                );
                return Err(e);
            }
            Err(e) if attempt + 1 >= max_attempts => {
                log.emit(
                    LogLevel::Warn,
                    "retry",
                    "retries exhausted",
                    vec![
                        ("attempts", max_attempts.to_string()),
                        ("error", e.to_string()),
                    ],
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_after(attempt);
                log.emit(
                    LogLevel::Debug,
                    "retry",
                    format!(
                        "transient error (attempt {}/{}), waiting {:?}",
                        attempt + 1,
                        max_attempts,
                        delay
                    ),
                    vec![("error", e.to_string())],
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let p = policy(5);
        assert_eq!(p.delay_after(0), Duration::from_millis(100));
        assert_eq!(p.delay_after(1), Duration::from_millis(200));
        assert_eq!(p.delay_after(2), Duration::from_millis(400));
        assert_eq!(p.delay_after(3), Duration::from_millis(500));
        assert_eq!(p.delay_after(30), Duration::from_millis(500));
        assert_eq!(p.schedule().len(), 4);
    }

    #[test]
    fn test_remaining_continues_schedule() {
        let p = policy(5);
        let rest = p.remaining(1);
        assert_eq!(rest.max_attempts, 4);
        assert_eq!(rest.delay_after(0), p.delay_after(1));
        assert_eq!(rest.delay_after(2), p.delay_after(3));
        assert_eq!(rest.schedule(), p.schedule()[1..].to_vec());
    }

    #[test]
    fn test_policy_from_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(
            p.schedule(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_attempts_every_time_with_growing_gaps() {
        let started = Instant::now();
        let calls: Arc<Mutex<Vec<Duration>>> = Arc::default();
        let seen = calls.clone();

        let result: Result<()> = retry_with_backoff(&policy(4), &Log::default(), |_| {
            seen.lock().unwrap().push(started.elapsed());
            async { Err(Error::Network("connection reset".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(Error::Network(_))));
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4);

        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert!(gaps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_recoverable_aborts_immediately() {
        let mut attempts = 0;
        let result: Result<()> = retry_with_backoff(&policy(5), &Log::default(), |_| {
            attempts += 1;
            async { Err(Error::InvalidEventName(String::new())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failure() {
        let result = retry_with_backoff(&policy(3), &Log::default(), |attempt| async move {
            if attempt == 0 {
                Err(Error::Timeout("slow".to_string()))
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
    }
}
