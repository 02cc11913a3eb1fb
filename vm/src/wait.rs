use std::{future::Future, path::Path, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("gave up waiting for {what} after {attempts} attempts")]
    Exhausted { what: String, attempts: u32 },

    #[error("cancelled while waiting for {what}")]
    Cancelled { what: String },
}

/// Bounded attempts with a delay between them that grows by `factor` up to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay: delay,
            max_delay: delay,
            factor: 1,
        }
    }

    pub const fn exponential(attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            initial_delay,
            max_delay,
            factor: 2,
        }
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = delay.saturating_mul(self.factor);
            if delay >= self.max_delay {
                return self.max_delay;
            }
        }
        delay.min(self.max_delay)
    }
}

/// Run `probe` until it reports success, returning the attempt it succeeded on.
pub async fn poll_until<F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut probe: F,
) -> Result<u32, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let cancelled = || WaitError::Cancelled {
        what: what.to_string(),
    };

    for attempt in 1..=policy.attempts {
        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            ready = probe() => ready,
        };
        if ready {
            debug!(what, attempt, "Ready");
            return Ok(attempt);
        }
        if attempt == policy.attempts {
            break;
        }

        let delay = policy.delay_after(attempt);
        trace!(what, attempt, ?delay, "Not ready yet");
        tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = sleep(delay) => {}
        }
    }

    Err(WaitError::Exhausted {
        what: what.to_string(),
        attempts: policy.attempts,
    })
}

/// Wait for a file or socket to appear on disk.
pub async fn wait_for_path(
    path: &Path,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let what = path.display().to_string();
    poll_until(policy, cancel, &what, || async {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    })
    .await
    .map(|_| ())
}
