//! Pacing for reconnect attempts.
//!
//! [`BackoffConfig::schedule`] yields the wait before each retry of one
//! reconnect cycle. The wait grows by `multiplier` per failure up to
//! `max_delay`, and with jitter on it is scaled by a random factor in
//! `0.5..1.5` so clients dropped by the same outage do not redial in step.
//! [`retry_with_backoff`] drives an operation through that schedule.

use crate::context::{Context, ContextError};
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How a lost session is re-established.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Attempts per reconnect cycle, counting the first.
    pub max_attempts: u32,
    /// Wait after the first failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth of the wait per failure.
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Randomize each wait by up to half either way.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after `failures` consecutive failed attempts (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let ceiling = self.max_delay.as_secs_f64();
        let mut secs = (self.base_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .clamp(0.0, ceiling);
        if self.jitter {
            secs = (secs * rand::rng().random_range(0.5..1.5)).min(ceiling);
        }
        Duration::from_secs_f64(secs)
    }

    /// The waits between the attempts of one cycle.
    pub fn schedule(&self) -> Backoff<'_> {
        Backoff {
            config: self,
            failures: 0,
        }
    }
}

/// Waits of one reconnect cycle: `max_attempts - 1` of them.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a BackoffConfig,
    failures: u32,
}

impl Iterator for Backoff<'_> {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.failures + 1 >= self.config.max_attempts.max(1) {
            return None;
        }
        self.failures += 1;
        Some(self.config.delay_after(self.failures))
    }
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the schedule runs out.
///
/// Returns the last outcome and the number of attempts made. `ctx` is raced
/// against every attempt and every wait; when it finishes first, the attempt
/// in flight is dropped and the context's own error comes back.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &BackoffConfig,
    ctx: &Context,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display + From<ContextError>,
{
    let mut schedule = config.schedule();
    let mut attempts = 0;

    loop {
        attempts += 1;
        let outcome = tokio::select! {
            biased;
            reason = ctx.done() => return (Err(reason.into()), attempts),
            outcome = operation() => outcome,
        };

        let err = match outcome {
            Ok(value) => return (Ok(value), attempts),
            Err(e) if !should_retry(&e) => {
                debug!("Attempt {} failed permanently: {}", attempts, e);
                return (Err(e), attempts);
            }
            Err(e) => e,
        };

        let Some(delay) = schedule.next() else {
            warn!("Attempt {} failed, none left: {}", attempts, err);
            return (Err(err), attempts);
        };
        warn!(
            "Attempt {}/{} failed: {}; next in {:?}",
            attempts,
            config.max_attempts.max(1),
            err,
            delay
        );

        tokio::select! {
            biased;
            reason = ctx.done() => return (Err(reason.into()), attempts),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use tokio::time::Instant;

    fn dial_failure(n: usize) -> RpcError {
        RpcError::Dial {
            address: "127.0.0.1:6000".to_string(),
            message: format!("refused ({})", n),
        }
    }

    /// Paused-clock sleeps land on the next millisecond tick.
    fn assert_waited(actual: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(2),
            "waited {:?}, expected about {:?}",
            actual,
            expected
        );
    }

    fn steady(attempts: u32, base_ms: u64) -> BackoffConfig {
        BackoffConfig::new()
            .with_max_attempts(attempts)
            .with_base_delay(Duration::from_millis(base_ms))
            .with_jitter(false)
    }

    #[test]
    fn test_schedule_doubles_then_caps() {
        let config = steady(6, 100).with_max_delay(Duration::from_millis(500));
        let waits: Vec<_> = config.schedule().map(|d| d.as_millis()).collect();
        assert_eq!(waits, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_single_attempt_never_waits() {
        assert_eq!(steady(1, 100).schedule().count(), 0);
        assert_eq!(steady(0, 100).schedule().count(), 0);
    }

    #[test]
    fn test_jitter_stays_within_half_either_side() {
        let config = BackoffConfig::new()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(5));

        for _ in 0..50 {
            let first = config.delay_after(1);
            assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(3));
            // 4s scaled up would pass the 5s ceiling.
            let second = config.delay_after(2);
            assert!(second >= Duration::from_secs(2) && second <= Duration::from_secs(5));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_redials_are_spaced_by_schedule() {
        let mut starts = Vec::new();

        let (result, attempts) = retry_with_backoff(
            &steady(5, 10),
            &Context::background(),
            || {
                starts.push(Instant::now());
                let n = starts.len();
                async move {
                    if n < 3 {
                        Err(dial_failure(n))
                    } else {
                        Ok(n)
                    }
                }
            },
            RpcError::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts, 3);
        assert_eq!(starts.len(), 3);
        assert_waited(starts[1] - starts[0], 10);
        assert_waited(starts[2] - starts[1], 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_cycle_returns_last_failure() {
        let started = Instant::now();
        let mut dials = 0;

        let (result, attempts) = retry_with_backoff(
            &steady(3, 10),
            &Context::background(),
            || {
                dials += 1;
                let n = dials;
                async move { Err::<(), _>(dial_failure(n)) }
            },
            RpcError::is_retryable,
        )
        .await;

        assert_eq!(attempts, 3);
        match result {
            Err(RpcError::Dial { message, .. }) => assert_eq!(message, "refused (3)"),
            other => panic!("Expected dial error, got: {:?}", other),
        }
        // No wait after the last attempt.
        assert_waited(started.elapsed(), 30);
    }

    #[tokio::test]
    async fn test_rejected_login_ends_cycle() {
        let mut calls = 0;

        let (result, attempts) = retry_with_backoff(
            &steady(5, 10),
            &Context::background(),
            || {
                calls += 1;
                async {
                    Err::<(), _>(RpcError::AuthenticationRejected {
                        message: "bad key".to_string(),
                    })
                }
            },
            RpcError::is_retryable,
        )
        .await;

        assert!(matches!(
            result,
            Err(RpcError::AuthenticationRejected { .. })
        ));
        assert_eq!(attempts, 1);
        assert_eq!(calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cuts_wait_short() {
        let config = steady(5, 3_600_000);
        let ctx = Context::background();
        let shutdown = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            shutdown.cancel();
        });

        let started = Instant::now();
        let (result, attempts) = retry_with_backoff(
            &config,
            &ctx,
            || async { Err::<(), _>(dial_failure(1)) },
            RpcError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert_eq!(attempts, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_shutdown_drops_hanging_attempt() {
        let ctx = Context::background();
        let shutdown = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            shutdown.cancel();
        });

        let started = std::time::Instant::now();
        let (result, _) = retry_with_backoff(
            &BackoffConfig::new(),
            &ctx,
            std::future::pending::<Result<(), RpcError>>,
            RpcError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
