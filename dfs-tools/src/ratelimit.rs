//! Token-bucket replication throttle.
//!
//! The master and chunkserver are each single-process here, so
//! `TokenBucket` wraps a plain `std::sync::Mutex<BucketState>` rather than
//! anything shared across processes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Returned by [`TokenBucket::wait`] when `max_wait` elapses before enough
/// tokens are available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout;

struct BucketState {
    /// `0` means unlimited.
    rate_bytes_per_sec: u64,
    capacity: u64,
    available: f64,
    last_refill: Instant,
    admitted_total: u64,
}

impl BucketState {
    fn refill(&mut self, now: Instant) {
        if self.rate_bytes_per_sec == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.available =
            (self.available + elapsed * self.rate_bytes_per_sec as f64).min(self.capacity as f64);
        self.last_refill = now;
    }
}

/// A token bucket gating bytes-per-second throughput. `wait(bytes, ..)`
/// either returns `Ok` once `bytes` tokens have been acquired or
/// `Err(Timeout)` after `max_wait`. Configuration is taken in kilobytes per
/// second; a rate of `0` makes `wait` return immediately (unlimited).
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_kbps: u64, capacity_bytes: u64) -> Self {
        let rate_bytes_per_sec = rate_kbps.saturating_mul(1024);
        TokenBucket {
            state: Mutex::new(BucketState {
                rate_bytes_per_sec,
                capacity: capacity_bytes.max(1),
                available: capacity_bytes as f64,
                last_refill: Instant::now(),
                admitted_total: 0,
            }),
        }
    }

    /// Unlimited bucket: every `wait()` call returns immediately.
    pub fn unlimited() -> Self {
        TokenBucket::new(0, 1)
    }

    pub fn update_rate(&self, rate_kbps: u64, capacity_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        state.refill(now);
        state.rate_bytes_per_sec = rate_kbps.saturating_mul(1024);
        state.capacity = capacity_bytes.max(1);
        state.available = state.available.min(state.capacity as f64);
    }

    /// Total bytes admitted since creation (or last `update_rate`), so
    /// tests can check admitted traffic stays within the configured rate.
    pub fn traffic(&self) -> u64 {
        self.state.lock().unwrap().admitted_total
    }

    /// Acquires `bytes` tokens, sleeping in increments as the bucket
    /// refills. Returns `Err(Timeout)` if `max_wait` elapses first.
    pub async fn wait(&self, bytes: u64, max_wait: Duration) -> Result<(), Timeout> {
        let deadline = Instant::now() + max_wait;
        loop {
            let sleep_for = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                state.refill(now);

                if state.rate_bytes_per_sec == 0 {
                    state.admitted_total += bytes;
                    return Ok(());
                }

                if state.available >= bytes as f64 {
                    state.available -= bytes as f64;
                    state.admitted_total += bytes;
                    return Ok(());
                }

                let missing = bytes as f64 - state.available;
                Duration::from_secs_f64(missing / state.rate_bytes_per_sec as f64)
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(Timeout);
            }
            let wake_at = (now + sleep_for).min(deadline);
            tokio::time::sleep_until(wake_at).await;
            if Instant::now() >= deadline {
                // One last attempt at the deadline in case the final refill
                // tick provided exactly enough tokens.
                let mut state = self.state.lock().unwrap();
                state.refill(Instant::now());
                if state.rate_bytes_per_sec == 0 || state.available >= bytes as f64 {
                    state.available -= bytes as f64;
                    state.admitted_total += bytes;
                    return Ok(());
                }
                return Err(Timeout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unlimited_bucket_never_waits() {
        let bucket = TokenBucket::unlimited();
        bucket.wait(1_000_000_000, Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_bucket_waits_then_admits() {
        let bucket = TokenBucket::new(10, 1024); // 10 KB/s, 1 KiB burst
        bucket.wait(1024, Duration::from_secs(5)).await.unwrap();
        // Bucket is now empty; a second request must wait for a refill.
        let start = Instant::now();
        bucket.wait(1024, Duration::from_secs(5)).await.unwrap();
        assert!(Instant::now() - start >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_rate_too_slow() {
        let bucket = TokenBucket::new(1, 0); // 1 KB/s, no burst
        let result = bucket.wait(1_000_000, Duration::from_secs(1)).await;
        assert_eq!(result, Err(Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn update_rate_takes_effect_on_next_wait() {
        let bucket = TokenBucket::new(1, 1);
        bucket.update_rate(1_000_000, 1_000_000);
        bucket.wait(500_000, Duration::from_millis(10)).await.unwrap();
    }
}
