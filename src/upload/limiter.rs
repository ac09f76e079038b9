//! Token-bucket rate limiter for part uploads
//!
//! Each part waits for `len(part)` tokens before it is handed to the client.
//! The bucket refills at `bytes_per_second` and holds at most `burst` tokens,
//! so over any one-second window at most `bytes_per_second + burst` bytes are
//! released.
//!
//! Waiters reserve their tokens up front and may drive the balance negative;
//! the deficit determines how long they sleep. Reservations are therefore
//! served in the order they were made.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket limiting the number of bytes released per second.
#[derive(Debug)]
pub struct RateLimiter {
    inner: Option<Mutex<Bucket>>,
}

#[derive(Debug)]
struct Bucket {
    fill_rate: f64,
    max_capacity: f64,
    current_capacity: f64,
    last_timestamp: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_timestamp);
        let fill_amount = elapsed.as_secs_f64() * self.fill_rate;
        self.current_capacity = f64::min(self.max_capacity, self.current_capacity + fill_amount);
        self.last_timestamp = now;
    }

    /// Reserve `amount` tokens and return how long the caller must wait.
    fn reserve(&mut self, amount: f64, now: Instant) -> Duration {
        self.refill(now);
        self.current_capacity -= amount;

        if self.current_capacity >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.current_capacity / self.fill_rate)
        }
    }
}

impl RateLimiter {
    /// Create a limiter releasing `bytes_per_second` with the given burst.
    ///
    /// A rate of zero disables limiting. The bucket starts full.
    pub fn new(bytes_per_second: u64, burst: u64) -> Self {
        if bytes_per_second == 0 {
            return Self::unlimited();
        }

        let burst = burst.max(1) as f64;
        Self {
            inner: Some(Mutex::new(Bucket {
                fill_rate: bytes_per_second as f64,
                max_capacity: burst,
                current_capacity: burst,
                last_timestamp: Instant::now(),
            })),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.inner.is_none()
    }

    /// Wait until `bytes` tokens are available.
    ///
    /// Dropping the returned future after the reservation was made does not
    /// refund the tokens.
    pub async fn acquire(&self, bytes: usize) {
        let Some(bucket) = &self.inner else {
            return;
        };

        let delay = bucket.lock().reserve(bytes as f64, Instant::now());
        if !delay.is_zero() {
            tracing::trace!(
                bytes = bytes,
                delay_ms = delay.as_millis() as u64,
                "Rate limiter delaying part upload"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
