//! Bounded task pool
//!
//! Wraps the tokio runtime with a concurrency limit so that a burst of
//! scheduled callbacks or block writes cannot starve the socket loops.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Default number of concurrent pool tasks
pub const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Clone)]
pub struct TaskPool {
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl TaskPool {
    pub fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Spawn a future on the pool; waits for a slot before it runs
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let active = self.active.clone();
        let idle = self.idle.clone();
        active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            // The semaphore is never closed while the pool exists
            let _permit = semaphore.acquire().await;
            future.await;
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }

    /// Run blocking work (file I/O) without stalling the runtime
    pub fn spawn_blocking<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawn(async move {
            let _ = tokio::task::spawn_blocking(f).await;
        });
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Wait until every spawned task has finished
    pub async fn join(&self) {
        while self.active.load(Ordering::SeqCst) > 0 {
            self.idle.notified().await;
        }
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_spawn_and_join() {
        let pool = TaskPool::new(4);
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..20 {
            let counter = counter.clone();
            pool.spawn(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let pool = TaskPool::new(2);
        let peak = Arc::new(AtomicU32::new(0));
        let running = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let peak = peak.clone();
            let running = running.clone();
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
        pool.join().await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
