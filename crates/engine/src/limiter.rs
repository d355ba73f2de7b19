//! Shared bandwidth gate for download workers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::DownloadError;

/// Byte-rate gate shared by all workers of one call.
///
/// Selected at construction: a zero rate yields the pass-through variant,
/// anything else a token bucket whose burst is one second's worth of rate.
#[derive(Debug)]
pub enum RateLimiter {
    /// Admits every request immediately
    Unlimited,
    /// Token bucket refilled continuously at the configured rate
    Limited(TokenBucket),
}

impl RateLimiter {
    /// `rate` in bytes per second; 0 means unlimited.
    pub fn new(rate: u64) -> Self {
        if rate == 0 {
            RateLimiter::Unlimited
        } else {
            RateLimiter::Limited(TokenBucket::new(rate))
        }
    }

    /// Suspends until `n` tokens have been admitted or `cancel` fires.
    ///
    /// Requests larger than the burst are admitted in rounds, so a caller
    /// asking for several seconds' worth of bytes waits proportionally
    /// instead of failing.
    pub async fn wait(&self, cancel: &CancellationToken, n: u64) -> Result<(), DownloadError> {
        match self {
            RateLimiter::Unlimited => Ok(()),
            RateLimiter::Limited(bucket) => bucket.wait(cancel, n).await,
        }
    }

    /// Returns true iff `n` tokens are available right now.
    pub fn try_acquire(&self, n: u64) -> bool {
        match self {
            RateLimiter::Unlimited => true,
            RateLimiter::Limited(bucket) => bucket.try_acquire(n),
        }
    }

    /// Configured rate in bytes per second; 0 when unlimited.
    pub fn rate(&self) -> u64 {
        match self {
            RateLimiter::Unlimited => 0,
            RateLimiter::Limited(bucket) => bucket.rate(),
        }
    }

    /// Updates the rate. Setting 0 on a bucket disables limiting and wakes
    /// every pending waiter. A limiter constructed unlimited stays that way.
    pub fn set_rate(&self, rate: u64) {
        if let RateLimiter::Limited(bucket) = self {
            bucket.set_rate(rate);
        }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    rate: AtomicU64,
    state: Mutex<BucketState>,
    notify: Notify,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate),
            state: Mutex::new(BucketState {
                // start with a full burst so the first read is not delayed
                tokens: rate as f64,
                last_refill: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    fn set_rate(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn try_acquire(&self, n: u64) -> bool {
        let rate = self.rate();
        if rate == 0 {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        state.refill(rate);
        if state.tokens >= n as f64 {
            state.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    async fn wait(&self, cancel: &CancellationToken, n: u64) -> Result<(), DownloadError> {
        let mut remaining = n as f64;
        loop {
            let rate = self.rate();
            if rate == 0 {
                return Ok(());
            }

            let sleep_for = {
                let mut state = self.state.lock().unwrap();
                state.refill(rate);
                let take = state.tokens.min(remaining);
                state.tokens -= take;
                remaining -= take;
                if remaining <= 0.0 {
                    return Ok(());
                }
                // sleep until the rest of this round could have refilled
                let deficit = remaining.min(rate as f64);
                Duration::from_secs_f64(deficit / rate as f64)
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(DownloadError::cancelled()),
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.notify.notified() => {}
            }
        }
    }
}

impl BucketState {
    fn refill(&mut self, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let burst = rate as f64;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate as f64).min(burst);
    }
}
