//! Token-bucket rate limiting keyed by node kind or arbitrary tag.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_update: Instant,
}

/// A token bucket: `rate` tokens per `interval`, capacity `rate`.
///
/// `acquire` suspends cooperatively until enough tokens have refilled;
/// refill is proportional to elapsed time.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    interval: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Creates a limiter allowing `rate` acquisitions per `interval`.
    #[must_use]
    pub fn new(rate: u32, interval: Duration) -> Self {
        Self {
            rate: f64::from(rate.max(1)),
            interval,
            state: Mutex::new(BucketState {
                tokens: f64::from(rate.max(1)),
                last_update: Instant::now(),
            }),
        }
    }

    /// Creates a limiter allowing `rate` acquisitions per second.
    #[must_use]
    pub fn per_second(rate: u32) -> Self {
        Self::new(rate, Duration::from_secs(1))
    }

    /// Acquires `n` tokens, suspending until they are available.
    pub async fn acquire(&self, n: u32) {
        let n = f64::from(n);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= n {
                    state.tokens -= n;
                    return;
                }
                let missing = n - state.tokens;
                Duration::from_secs_f64(missing * self.interval.as_secs_f64() / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Tries to take `n` tokens without waiting.
    pub async fn try_acquire(&self, n: u32) -> bool {
        let n = f64::from(n);
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        let refill = elapsed * self.rate / self.interval.as_secs_f64();
        state.tokens = (state.tokens + refill).min(self.rate);
        state.last_update = now;
    }
}

/// Rate limiters keyed by node kind name or arbitrary tag.
#[derive(Debug, Default, Clone)]
pub struct RateLimiterSet {
    limiters: Arc<RwLock<HashMap<String, Arc<RateLimiter>>>>,
}

impl RateLimiterSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a limiter for a key, replacing any existing one.
    pub fn set(&self, key: impl Into<String>, limiter: RateLimiter) {
        self.limiters
            .write()
            .unwrap()
            .insert(key.into(), Arc::new(limiter));
    }

    /// Returns the limiter for a key, if one is installed.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().unwrap().get(key).cloned()
    }

    /// Acquires one token for the key, when a limiter is installed.
    pub async fn acquire(&self, key: &str) {
        if let Some(limiter) = self.get(key) {
            limiter.acquire(1).await;
        }
    }
}
