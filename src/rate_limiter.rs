//! Token bucket rate limiter (C2). Direct port of
//! `original_source/src/core/rate_limiter.py`, including the "sleep outside
//! the lock" discipline (H-16) and the consecutive-success hysteresis
//! reset (H-17).

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::RateLimiterConfig;

const CONSECUTIVE_SUCCESS_THRESHOLD: u32 = 3;

struct Inner {
    timestamps: VecDeque<Instant>,
    backoff_until: Instant,
    consecutive_throttles: u32,
    consecutive_successes: u32,
}

pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_seconds: f64) -> Self {
        let now = Instant::now();
        Self {
            max_requests: max_requests as usize,
            window: Duration::from_secs_f64(window_seconds),
            inner: Mutex::new(Inner {
                timestamps: VecDeque::new(),
                backoff_until: now,
                consecutive_throttles: 0,
                consecutive_successes: 0,
            }),
        }
    }

    pub fn from_config(cfg: &RateLimiterConfig) -> Self {
        Self::new(cfg.max_requests, cfg.window_seconds)
    }

    fn prune(timestamps: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        let cutoff = now.checked_sub(window).unwrap_or(now);
        while matches!(timestamps.front(), Some(t) if *t < cutoff) {
            timestamps.pop_front();
        }
    }

    /// Must not hold the lock across a sleep (spec §4.2, invariant 6).
    pub async fn acquire(&self) {
        // Phase 1: backoff wait, outside the lock.
        let backoff_wait = {
            let inner = self.inner.lock().await;
            let now = Instant::now();
            if now < inner.backoff_until {
                Some(inner.backoff_until - now)
            } else {
                None
            }
        };
        if let Some(wait) = backoff_wait {
            warn!(wait_seconds = wait.as_secs_f64(), "rate_limit_backoff");
            tokio::time::sleep(wait).await;
        }

        // Phase 2: acquire a slot, looping until one frees up.
        loop {
            let sleep_time = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                Self::prune(&mut inner.timestamps, self.window, now);
                if inner.timestamps.len() < self.max_requests {
                    inner.timestamps.push_back(now);
                    return;
                }
                let oldest = *inner.timestamps.front().expect("non-empty: len >= max_requests > 0");
                (oldest + self.window).saturating_duration_since(now)
            };

            info!(wait_seconds = sleep_time.as_secs_f64(), "rate_limit_wait");
            tokio::time::sleep(sleep_time + Duration::from_millis(100)).await;
        }
    }

    pub async fn record_throttled(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_throttles += 1;
        inner.consecutive_successes = 0;
        let backoff_secs = (2u64.saturating_pow(inner.consecutive_throttles)).min(60);
        inner.backoff_until = Instant::now() + Duration::from_secs(backoff_secs);
        warn!(
            consecutive = inner.consecutive_throttles,
            backoff_seconds = backoff_secs,
            "rate_limit_hit"
        );
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= CONSECUTIVE_SUCCESS_THRESHOLD {
            if inner.consecutive_throttles > 0 {
                info!(
                    after_successes = inner.consecutive_successes,
                    previous_errors = inner.consecutive_throttles,
                    "rate_limit_counter_reset"
                );
            }
            inner.consecutive_throttles = 0;
            inner.consecutive_successes = 0;
        }
    }

    pub async fn consecutive_throttles(&self) -> u32 {
        self.inner.lock().await.consecutive_throttles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn five_requests_under_limit_do_not_sleep() {
        let limiter = RateLimiter::new(5, 1.0);
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < StdDuration::from_millis(200));
    }

    // S3 — rate-limit backoff and hysteretic reset.
    #[tokio::test]
    async fn backoff_and_hysteretic_reset() {
        let limiter = RateLimiter::new(5, 1.0);
        for _ in 0..5 {
            limiter.acquire().await;
        }
        limiter.record_throttled().await;
        assert_eq!(limiter.consecutive_throttles().await, 1);

        let start = std::time::Instant::now();
        limiter.acquire().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= StdDuration::from_millis(1800), "expected ~2s backoff, got {elapsed:?}");

        limiter.record_success().await;
        limiter.record_success().await;
        limiter.record_success().await;
        assert_eq!(limiter.consecutive_throttles().await, 0);

        limiter.record_throttled().await;
        assert_eq!(limiter.consecutive_throttles().await, 1);
    }

    #[tokio::test]
    async fn acquire_does_not_hold_lock_across_sleep() {
        let limiter = Arc::new(RateLimiter::new(2, 1.0));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = std::time::Instant::now();
        let l1 = limiter.clone();
        let l2 = limiter.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { l1.acquire().await }),
            tokio::spawn(async move { l2.acquire().await }),
        );
        a.unwrap();
        b.unwrap();
        // Both concurrent waiters should resolve close to the window
        // boundary, not serialize as N independent per-call sleeps.
        assert!(start.elapsed() < StdDuration::from_millis(1400));
    }
}
