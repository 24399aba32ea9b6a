//! Lock-free token-bucket throttle (C3, §4.3).
//!
//! Limited to `rate` bytes per interval (canonically one second). Bucket
//! capacity equals one interval's worth of tokens. `wait(n)` blocks until
//! `n` tokens are available, then consumes them, implemented with atomic
//! compare-and-swap on the refill timestamp and atomic add/sub on the token
//! count — no lock is ever taken.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Token-bucket rate limiter shared across all concurrent article uploads
/// within a job (and, if constructed once and cloned, across jobs).
#[derive(Clone)]
pub struct Throttle {
    /// Rate limit in bytes per second (0 = unlimited)
    rate_bps: Arc<AtomicU64>,
    /// Available tokens (current bucket capacity in bytes)
    tokens: Arc<AtomicU64>,
    /// Last refill timestamp (nanoseconds since an arbitrary process-local epoch)
    last_refill: Arc<AtomicU64>,
}

impl Throttle {
    /// Construct a throttle with the given rate. `None` or `Some(0)` means unlimited.
    #[must_use]
    pub fn new(rate_bps: Option<u64>) -> Self {
        let rate = rate_bps.unwrap_or(0);
        let now = Self::now_nanos();
        Self {
            rate_bps: Arc::new(AtomicU64::new(rate)),
            tokens: Arc::new(AtomicU64::new(rate)),
            last_refill: Arc::new(AtomicU64::new(now)),
        }
    }

    /// Update the rate. Takes effect immediately; increasing the rate tops
    /// up the bucket by the difference, decreasing it leaves existing
    /// tokens alone until consumed.
    pub fn set_rate(&self, rate_bps: Option<u64>) {
        let new_rate = rate_bps.unwrap_or(0);
        let old_rate = self.rate_bps.swap(new_rate, Ordering::SeqCst);
        if new_rate > old_rate {
            self.tokens.fetch_add(new_rate - old_rate, Ordering::SeqCst);
        }
    }

    /// Current rate, `None` if unlimited.
    pub fn rate(&self) -> Option<u64> {
        let rate = self.rate_bps.load(Ordering::Relaxed);
        if rate == 0 { None } else { Some(rate) }
    }

    /// Block until `n` bytes' worth of tokens are available, then consume them.
    /// A no-op fast path when the configured rate is 0 (unlimited) or `n == 0`.
    pub async fn wait(&self, n: u64) {
        if n == 0 {
            return;
        }
        if self.rate_bps.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = n;
        loop {
            let rate = self.rate_bps.load(Ordering::Relaxed);
            if rate == 0 {
                return;
            }

            self.refill();

            let current = self.tokens.load(Ordering::SeqCst);
            let to_consume = remaining.min(current);

            if to_consume > 0 {
                if self
                    .tokens
                    .compare_exchange(
                        current,
                        current - to_consume,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= to_consume;
                    if remaining == 0 {
                        return;
                    }
                }
                continue;
            }

            let wait_ms = (remaining as f64 / rate as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    fn refill(&self) {
        let rate = self.rate_bps.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }

        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let tokens_to_add = (rate as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let current = self.tokens.load(Ordering::SeqCst);
            let updated = (current + tokens_to_add).min(rate);
            self.tokens.store(updated, Ordering::SeqCst);
        }
    }

    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_rate_increase_tops_up_bucket() {
        let throttle = Throttle::new(Some(5_000_000));
        let old_tokens = throttle.tokens.load(Ordering::Relaxed);
        throttle.set_rate(Some(10_000_000));
        assert_eq!(throttle.rate(), Some(10_000_000));
        assert_eq!(
            throttle.tokens.load(Ordering::Relaxed),
            old_tokens + 5_000_000
        );
    }

    #[test]
    fn set_rate_decrease_leaves_tokens() {
        let throttle = Throttle::new(Some(10_000_000));
        let old_tokens = throttle.tokens.load(Ordering::Relaxed);
        throttle.set_rate(Some(5_000_000));
        assert_eq!(throttle.rate(), Some(5_000_000));
        assert_eq!(throttle.tokens.load(Ordering::Relaxed), old_tokens);
    }

    #[tokio::test]
    async fn unlimited_wait_returns_immediately() {
        let throttle = Throttle::new(None);
        let start = Instant::now();
        throttle.wait(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn zero_byte_wait_returns_immediately_even_when_drained() {
        let throttle = Throttle::new(Some(100));
        throttle.tokens.store(0, Ordering::SeqCst);
        let start = Instant::now();
        throttle.wait(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_blocks_until_tokens_refill() {
        let rate = 1_000u64;
        let throttle = Throttle::new(Some(rate));
        throttle.tokens.store(0, Ordering::SeqCst);
        throttle
            .last_refill
            .store(Throttle::now_nanos(), Ordering::SeqCst);

        let start = Instant::now();
        throttle.wait(500).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(250));
        assert!(elapsed <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn sixteen_concurrent_waits_respect_one_second_burst(
    ) {
        // §8 scenario 5: 16 concurrent Wait(100_000) on a 1_000_000 B/s throttle
        let rate = 1_000_000u64;
        let throttle = Throttle::new(Some(rate));
        throttle.tokens.store(0, Ordering::SeqCst);
        throttle
            .last_refill
            .store(Throttle::now_nanos(), Ordering::SeqCst);

        let start = Instant::now();
        let mut handles = vec![];
        for _ in 0..16 {
            let t = throttle.clone();
            handles.push(tokio::spawn(async move {
                t.wait(100_000).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let elapsed = start.elapsed();

        // total 1,600,000 bytes at 1,000,000 B/s => ~1.6s, generous tolerance
        assert!(elapsed >= Duration::from_millis(800));
        assert!(elapsed <= Duration::from_millis(4000));
    }

    #[test]
    fn clone_shares_state() {
        let original = Throttle::new(Some(1_000_000));
        let clone = original.clone();
        clone.set_rate(Some(5_000_000));
        assert_eq!(original.rate(), Some(5_000_000));
    }
}
