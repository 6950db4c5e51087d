use crate::TileError;
use std::thread;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
}

pub trait BackoffPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> Duration;
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff_ms: 120,
        }
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(attempt as u64))
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempts are used up.
pub fn with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, TileError>
where
    F: FnMut() -> Result<T, TileError>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "transient store error, retrying");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
