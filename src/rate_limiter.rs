//! Token-bucket rate limiter used by the agent worker pool. A ticker refills
//! one token every `1/rate` seconds up to `rate` tokens of capacity; `acquire`
//! blocks until a token is available. `rate = 0` disables limiting entirely.

use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Duration};

struct State {
    tokens: u32,
    capacity: u32,
}

pub struct RateLimiter {
    rate: u32,
    state: Mutex<State>,
    notify: Notify,
}

impl RateLimiter {
    /// `rate` is tokens/sec and also the reservoir capacity. `rate = 0`
    /// disables limiting.
    pub fn new(rate: u32) -> Arc<Self> {
        let limiter = Arc::new(RateLimiter {
            rate,
            state: Mutex::new(State {
                tokens: rate,
                capacity: rate,
            }),
            notify: Notify::new(),
        });
        if rate > 0 {
            let weak = Arc::downgrade(&limiter);
            tokio::spawn(async move {
                let mut ticker = time::interval(Duration::from_secs_f64(1.0 / rate as f64));
                loop {
                    ticker.tick().await;
                    let Some(limiter) = weak.upgrade() else {
                        break;
                    };
                    let mut state = limiter.state.lock().await;
                    if state.tokens < state.capacity {
                        state.tokens += 1;
                        drop(state);
                        limiter.notify.notify_one();
                    }
                }
            });
        }
        limiter
    }

    /// Blocks until a token is available. No-op when rate limiting is disabled.
    pub async fn acquire(&self) {
        if self.rate == 0 {
            return;
        }
        loop {
            {
                let mut state = self.state.lock().await;
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn disabled_limiter_never_blocks() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn reservoir_caps_at_capacity() {
        let limiter = RateLimiter::new(5);
        // Starts full: first 5 acquires should be immediate.
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_blocks_once_reservoir_drained() {
        let limiter = RateLimiter::new(10);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        // Next token arrives roughly 100ms later (1/10s refill interval).
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
