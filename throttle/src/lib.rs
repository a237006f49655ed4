//! Bandwidth limiting for data transfers
//!
//! A [`Throttle`] converts a bytes-per-second budget into a token bucket where one token stands
//! for [`CHUNK_SIZE`] bytes. Workers pay for a transfer before issuing it:
//!
//! ```text
//! tokens = ⌈bytes / CHUNK_SIZE⌉
//! ```
//!
//! Large payments are split into slices no bigger than the bucket so a single big file can never
//! wait for more tokens than the bucket is able to hold.
//!
//! # Replenishment
//!
//! The bucket is refilled by [`Throttle::run_replenish`], which the owner spawns once. For
//! budgets of at least ten tokens per second the bucket is refilled every 100ms; slower budgets
//! refill one token at a time at a proportionally longer interval so that the average rate is
//! preserved.
//!
//! ```rust,no_run
//! # async fn example() {
//! let throttle = std::sync::Arc::new(throttle::Throttle::new(8 * 1024 * 1024));
//! tokio::spawn({
//!     let throttle = throttle.clone();
//!     async move { throttle.run_replenish().await }
//! });
//! throttle.consume_bytes(32 * 1024 * 1024).await;
//! # }
//! ```

mod semaphore;

/// Bytes represented by a single token
pub const CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Debug)]
pub struct Throttle {
    bucket: semaphore::TokenBucket,
    interval: std::time::Duration,
}

impl Throttle {
    pub fn new(bytes_per_second: u64) -> Self {
        let tokens_per_second = std::cmp::max(1, bytes_per_second / CHUNK_SIZE);
        let (capacity, interval) = if tokens_per_second >= 10 {
            (
                (tokens_per_second / 10) as usize,
                std::time::Duration::from_millis(100),
            )
        } else {
            (
                1,
                std::time::Duration::from_secs_f64(1.0 / tokens_per_second as f64),
            )
        };
        tracing::debug!(
            "throttle: {} bytes/s as {} tokens every {:?}",
            bytes_per_second,
            capacity,
            interval
        );
        Self {
            bucket: semaphore::TokenBucket::new(capacity),
            interval,
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        self.interval
    }

    pub fn tokens_per_interval(&self) -> usize {
        self.bucket.capacity()
    }

    pub fn tokens_for(bytes: u64) -> u64 {
        if bytes == 0 {
            return 0;
        }
        1 + (bytes - 1) / CHUNK_SIZE
    }

    /// Wait until the budget allows moving `bytes`
    pub async fn consume_bytes(&self, bytes: u64) {
        let mut remaining = Self::tokens_for(bytes);
        let slice = self.bucket.capacity() as u64;
        while remaining > 0 {
            let take = std::cmp::min(remaining, slice);
            // slice is derived from a usize capacity, so it always fits
            let take_u32 = u32::try_from(take).unwrap_or(u32::MAX);
            self.bucket.consume_many(take_u32).await;
            remaining -= u64::from(take_u32);
        }
    }

    pub async fn run_replenish(&self) {
        self.bucket.run_replenish(self.interval).await;
    }
}
