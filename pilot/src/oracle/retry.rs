use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::OracleError;

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Bound on retrying transient oracle failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Stop once this much time has elapsed since the first attempt.
    MaxElapsed(Duration),
    /// Stop after this many attempts in total.
    MaxAttempts(u32),
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::MaxElapsed(Duration::from_secs(60))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    INITIAL_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

/// Run `op` until it succeeds, fails non-transiently, or the policy is spent.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, task: &str, mut op: F) -> Result<T, OracleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        let delay = match policy {
            RetryPolicy::MaxAttempts(max) if attempt >= max => None,
            RetryPolicy::MaxAttempts(_) => Some(backoff_delay(attempt)),
            RetryPolicy::MaxElapsed(window) => {
                let elapsed = started.elapsed();
                (elapsed < window).then(|| backoff_delay(attempt).min(window - elapsed))
            }
        };
        let Some(delay) = delay else {
            tracing::error!(task, attempt, error = %err, "Oracle call failed, giving up");
            return Err(err);
        };
        tracing::warn!(
            task,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Oracle call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
