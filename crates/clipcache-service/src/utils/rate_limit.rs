//! Spacing of outgoing requests to a fixed rate.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Lets callers through at no more than a fixed number per second, with a burst of one.
///
/// Every [`acquire`](Self::acquire) reserves the next free slot and sleeps until it is due, so
/// concurrent callers are released one interval apart in the order they arrived.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a limiter admitting `per_second` callers per second.
    ///
    /// Non-finite or non-positive rates admit everyone immediately.
    pub fn new(per_second: f64) -> Self {
        let interval = if per_second.is_finite() && per_second > 0.0 {
            Duration::from_secs_f64(1.0 / per_second)
        } else {
            Duration::ZERO
        };

        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Waits for the next slot and returns how long the caller had to wait.
    pub async fn acquire(&self) -> Duration {
        if self.interval.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + self.interval);
            slot
        };

        tokio::time::sleep_until(slot).await;
        slot - now
    }
}
