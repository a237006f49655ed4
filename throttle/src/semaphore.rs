/// Token bucket backed by a tokio semaphore
///
/// Tokens are consumed (forgotten) rather than returned, and a replenish loop tops the bucket
/// back up to `capacity` every interval.
#[derive(Debug)]
pub struct TokenBucket {
    sem: tokio::sync::Semaphore,
    capacity: usize,
}

impl TokenBucket {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: tokio::sync::Semaphore::new(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take `tokens` out of the bucket; callers keep `tokens <= capacity`
    pub async fn consume_many(&self, tokens: u32) {
        match self.sem.acquire_many(tokens).await {
            Ok(permit) => permit.forget(),
            // only happens if the semaphore is closed, which we never do
            Err(err) => tracing::warn!("token bucket unavailable: {}", err),
        }
    }

    pub fn refill(&self) {
        let available = self.sem.available_permits();
        if available < self.capacity {
            self.sem.add_permits(self.capacity - available);
        }
    }

    pub async fn run_replenish(&self, interval: std::time::Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.refill();
        }
    }
}
