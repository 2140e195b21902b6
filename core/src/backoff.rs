//! Bounded retry with exponential backoff and jitter.

use rand::{thread_rng, Rng};
use std::time::Duration;

/// Polls a condition a bounded number of times, sleeping between attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    attempts: u32,
    base_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new(4, Duration::from_millis(250))
    }
}

impl Backoff {
    /// `attempts` is clamped to at least one.
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Backoff { attempts: attempts.max(1), base_delay }
    }

    /// Single attempt, never sleeps.
    pub fn once() -> Self {
        Backoff::new(1, Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << attempt.saturating_sub(1).min(6));
        let jitter = thread_rng().gen_range(0..(exp / 4 + 1));
        Duration::from_millis(exp.saturating_add(jitter))
    }

    /// Calls `probe` until it yields `Some`, an error, or attempts run out.
    pub fn poll<T, E, F>(&self, mut probe: F) -> Result<Option<T>, E>
    where
        F: FnMut() -> Result<Option<T>, E>,
    {
        for attempt in 1..=self.attempts {
            if let Some(v) = probe()? {
                return Ok(Some(v));
            }
            if attempt < self.attempts {
                let delay = self.delay_after(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "not ready, backing off");
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
        Ok(None)
    }
}
