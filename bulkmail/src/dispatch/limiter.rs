//! Throttling between transport calls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::info;

/// Grants permission for each transport call of a run.
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until the recipient at `sequence_index` may be attempted.
    async fn acquire(&self, sequence_index: u64);
}

/// Count-based batcher: after every `batch_size` acquisitions, the next one
/// waits `delay`.
///
/// This bounds bursts against the transport rather than enforcing a precise
/// rate. The window is guarded by a mutex held across the pause, so
/// concurrent callers sharing one limiter all stop at the batch boundary.
pub struct BatchLimiter {
    batch_size: usize,
    delay: Duration,
    issued: Mutex<usize>,
    pauses: AtomicU64,
}

impl BatchLimiter {
    /// A `batch_size` of zero disables throttling.
    pub fn new(batch_size: usize, delay: Duration) -> Self {
        Self {
            batch_size,
            delay,
            issued: Mutex::new(0),
            pauses: AtomicU64::new(0),
        }
    }

    /// Number of inter-batch pauses taken so far.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Throttle for BatchLimiter {
    async fn acquire(&self, sequence_index: u64) {
        if self.batch_size == 0 {
            return;
        }

        let mut issued = self.issued.lock().await;
        if *issued >= self.batch_size {
            info!(
                sequence_index = sequence_index,
                batch_size = self.batch_size,
                delay_ms = self.delay.as_millis() as u64,
                "dispatch_batch_pause"
            );
            sleep(self.delay).await;
            self.pauses.fetch_add(1, Ordering::Relaxed);
            *issued = 0;
        }
        *issued += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_pauses_only_between_batches() {
        let limiter = BatchLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        for i in 0..5 {
            limiter.acquire(i).await;
        }

        // Pauses before the 3rd and 5th acquisitions.
        assert_eq!(limiter.pauses(), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(20));
        assert!(elapsed < Duration::from_secs(21));
    }

    #[tokio::test]
    async fn test_batch_boundary_arithmetic() {
        let limiter = BatchLimiter::new(50, Duration::ZERO);
        for i in 0..120 {
            limiter.acquire(i).await;
        }
        assert_eq!(limiter.pauses(), 2);

        let exact = BatchLimiter::new(50, Duration::ZERO);
        for i in 0..100 {
            exact.acquire(i).await;
        }
        // No trailing pause after the final batch.
        assert_eq!(exact.pauses(), 1);
    }

    #[tokio::test]
    async fn test_zero_batch_size_never_pauses() {
        let limiter = BatchLimiter::new(0, Duration::from_secs(60));
        for i in 0..10 {
            limiter.acquire(i).await;
        }
        assert_eq!(limiter.pauses(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_between_tasks() {
        let limiter = Arc::new(BatchLimiter::new(3, Duration::from_secs(1)));
        let mut handles = Vec::new();
        for i in 0..9 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move { limiter.acquire(i).await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(limiter.pauses(), 2);
    }
}
