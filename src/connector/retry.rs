use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConnectError;

/// Exponential backoff budget shared by connection establishment and
/// transient request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based): initial * 2^(attempt-1), capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
pub async fn with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    backend: &'static str,
    op: F,
) -> Result<T, ConnectError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    attempt_loop(policy, backend, |_| true, op)
        .await
        .map_err(|(attempts, err)| ConnectError {
            backend,
            attempts,
            message: err.to_string(),
        })
}

/// Like [`with_backoff`] for calls on an established backend: only errors
/// `transient` accepts are retried, and the last error is returned as is.
pub async fn retry_call<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    backend: &'static str,
    transient: P,
    op: F,
) -> Result<T, E>
where
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    attempt_loop(policy, backend, transient, op)
        .await
        .map_err(|(_, err)| err)
}

async fn attempt_loop<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    backend: &'static str,
    transient: P,
    mut op: F,
) -> Result<T, (u32, E)>
where
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(backend, attempt, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) if !transient(&err) => return Err((attempt, err)),
            Err(err) if attempt >= max_attempts => {
                warn!(backend, attempt, error = %err, "giving up");
                return Err((attempt, err));
            }
            Err(err) => {
                let delay = policy.delay_after(attempt);
                warn!(
                    backend,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed; backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
