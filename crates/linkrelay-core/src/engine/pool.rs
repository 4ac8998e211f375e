//! Bounded worker pool
//!
//! Submitting never blocks: the job is spawned immediately and waits for one
//! of the pool's permits inside its own task. The tracker lets shutdown wait
//! for every job that was accepted.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Returned by [`WorkerPool::spawn`] once shutdown has begun
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Worker pool is closed")]
pub struct PoolClosed;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            size,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Jobs currently holding a permit
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub fn spawn<F>(&self, job: F) -> Result<JoinHandle<F::Output>, PoolClosed>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(PoolClosed);
        }

        let permits = self.permits.clone();
        Ok(self.tracker.spawn(async move {
            // The semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            job.await
        }))
    }

    /// Stop accepting jobs and wait for the accepted ones to finish
    pub async fn shutdown(&self) {
        self.tracker.close();
        debug!(
            "Waiting for {} pool jobs ({} running)",
            self.tracker.len(),
            self.busy()
        );
        self.tracker.wait().await;
        info!("Worker pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();

        for handle in handles {
            tokio_test::assert_ok!(handle.await);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_refuses() {
        let pool = WorkerPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let done = done.clone();
            pool.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(pool.is_closed());
        tokio_test::assert_err!(pool.spawn(async {}));
    }
}
