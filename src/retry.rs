use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

/// Bounded retry with exponential backoff (x1.5 per failure, capped)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub construct_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            construct_attempts: 2,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn once() -> Self {
        RetryPolicy {
            construct_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far
    pub fn backoff(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay_ms as f64 * 1.5_f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(scaled.min(self.max_delay_ms as f64) as u64)
    }

    /// Run `op` until it succeeds or the attempts are used up, returning
    /// the last error.
    pub fn run<T, E, F>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        E: std::fmt::Display,
    {
        let attempts = self.construct_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("{} succeeded after {} attempt(s)", what, attempt);
                    }
                    return Ok(value);
                }
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    let delay = self.backoff(attempt);
                    log::warn!(
                        "{} attempt {}/{} failed: {}; retrying in {:.2}s",
                        what,
                        attempt,
                        attempts,
                        err,
                        delay.as_secs_f64()
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}
