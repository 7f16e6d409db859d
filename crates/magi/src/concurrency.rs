//! Process-wide semaphore over LLM calls.
//!
//! A single instance is shared by every engine in the process and must be
//! injected explicitly in production code paths; default construction is for
//! tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{MagiError, Result};

pub const DEFAULT_LLM_CONCURRENCY_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyMetrics {
    pub active: usize,
    pub waiting: usize,
    pub total_acquired: u64,
    pub total_timeouts: u64,
    pub total_rate_limits: u64,
}

/// RAII permit; dropping releases the slot and decrements the active gauge.
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ConcurrencyController {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    waiting: AtomicUsize,
    total_acquired: AtomicU64,
    total_timeouts: AtomicU64,
    total_rate_limits: AtomicU64,
}

impl ConcurrencyController {
    pub fn new(max_concurrent: usize) -> Self {
        assert!(max_concurrent >= 1, "max_concurrent must be >= 1");
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            active: Arc::new(AtomicUsize::new(0)),
            waiting: AtomicUsize::new(0),
            total_acquired: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            total_rate_limits: AtomicU64::new(0),
        }
    }

    /// Acquire a permit, optionally bounded by a timeout. Timing out counts
    /// toward `total_timeouts` and raises [`MagiError::ConcurrencyLimit`].
    pub async fn acquire(&self, timeout: Option<Duration>) -> Result<ConcurrencyPermit> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let acquired = match timeout {
            None => self.semaphore.clone().acquire_owned().await,
            Some(limit) => {
                match tokio::time::timeout(limit, self.semaphore.clone().acquire_owned()).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.waiting.fetch_sub(1, Ordering::SeqCst);
                        self.total_timeouts.fetch_add(1, Ordering::SeqCst);
                        return Err(MagiError::ConcurrencyLimit(limit));
                    }
                }
            }
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = acquired.map_err(|_| {
            MagiError::Internal("concurrency semaphore closed".to_string())
        })?;

        self.active.fetch_add(1, Ordering::SeqCst);
        self.total_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(ConcurrencyPermit {
            _permit: permit,
            active: Arc::clone(&self.active),
        })
    }

    /// Record a provider-side rate limit for metrics.
    pub fn note_rate_limit(&self) {
        self.total_rate_limits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> ConcurrencyMetrics {
        ConcurrencyMetrics {
            active: self.active.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            total_acquired: self.total_acquired.load(Ordering::SeqCst),
            total_timeouts: self.total_timeouts.load(Ordering::SeqCst),
            total_rate_limits: self.total_rate_limits.load(Ordering::SeqCst),
        }
    }
}

impl Default for ConcurrencyController {
    /// Test convenience only; production wiring injects a configured
    /// instance from the process entry point.
    fn default() -> Self {
        Self::new(DEFAULT_LLM_CONCURRENCY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let controller = ConcurrencyController::new(2);
        let p1 = controller.acquire(None).await.unwrap();
        let p2 = controller.acquire(None).await.unwrap();
        assert_eq!(controller.metrics().active, 2);

        drop(p1);
        assert_eq!(controller.metrics().active, 1);
        drop(p2);

        let metrics = controller.metrics();
        assert_eq!(metrics.active, 0);
        assert_eq!(metrics.total_acquired, 2);
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let controller = ConcurrencyController::new(1);
        let _held = controller.acquire(None).await.unwrap();

        let result = controller.acquire(Some(Duration::from_millis(20))).await;
        assert!(matches!(result, Err(MagiError::ConcurrencyLimit(_))));
        assert_eq!(controller.metrics().total_timeouts, 1);
        assert_eq!(controller.metrics().waiting, 0);
    }

    #[tokio::test]
    async fn test_waiter_unblocked_on_release() {
        let controller = Arc::new(ConcurrencyController::new(1));
        let held = controller.acquire(None).await.unwrap();

        let waiter = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller.acquire(Some(Duration::from_secs(5))).await
            })
        };

        tokio::task::yield_now().await;
        drop(held);

        let result = waiter.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_counter() {
        let controller = ConcurrencyController::default();
        controller.note_rate_limit();
        controller.note_rate_limit();
        assert_eq!(controller.metrics().total_rate_limits, 2);
    }
}
