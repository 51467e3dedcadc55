//! Bounded retries around single I/O calls.

use crate::errors::MediaResult;
use std::{future::Future, time::Duration};
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op`, retrying transient failures with linear backoff. Any other
    /// error, or the last transient one, is returned as is.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> MediaResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MediaResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(
                        "{} failed on attempt {}/{}: {}",
                        label, attempt, self.attempts, err
                    );
                    tokio::time::sleep(self.backoff * attempt).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}
