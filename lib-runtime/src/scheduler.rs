//! Time-ordered task scheduler
//!
//! Accepts (deadline, callback) pairs and fires ready callbacks on the
//! task pool. Tasks are identified by opaque ids; cancelling removes a
//! pending task before it runs. Repeating tasks reschedule themselves
//! until cancelled.

use crate::pool::TaskPool;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Opaque handle to a scheduled task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

enum Entry {
    Once(Box<dyn FnOnce() + Send + 'static>),
    Repeating {
        callback: Arc<dyn Fn() + Send + Sync + 'static>,
        interval: Duration,
    },
}

struct Inner {
    queue: Mutex<BinaryHeap<Reverse<(Instant, u64)>>>,
    entries: Mutex<HashMap<u64, Entry>>,
    wake: Notify,
    next_id: AtomicU64,
    pool: TaskPool,
}

/// Shared scheduler; clone freely
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Create a scheduler and start its driver task
    pub fn new(pool: TaskPool) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BinaryHeap::new()),
            entries: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
            pool,
        });
        let scheduler = Self { inner };
        scheduler.start_driver();
        scheduler
    }

    /// Run a callback once after a delay
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, callback)
    }

    /// Run a callback once at a deadline
    pub fn schedule_at<F>(&self, deadline: Instant, callback: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.entries.lock().insert(id, Entry::Once(Box::new(callback)));
        self.inner.queue.lock().push(Reverse((deadline, id)));
        self.inner.wake.notify_waiters();
        TaskId(id)
    }

    /// Run a callback every `interval`, first firing after one interval
    pub fn repeat<F>(&self, interval: Duration, callback: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.entries.lock().insert(
            id,
            Entry::Repeating { callback: Arc::new(callback), interval },
        );
        self.inner.queue.lock().push(Reverse((Instant::now() + interval, id)));
        self.inner.wake.notify_waiters();
        TaskId(id)
    }

    /// Remove a pending task; a task already running is not interrupted
    pub fn cancel(&self, id: TaskId) -> bool {
        let removed = self.inner.entries.lock().remove(&id.0).is_some();
        if removed {
            self.inner.wake.notify_waiters();
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.inner.entries.lock().len()
    }

    fn start_driver(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let next_deadline = inner.queue.lock().peek().map(|Reverse((t, _))| *t);
                match next_deadline {
                    None => inner.wake.notified().await,
                    Some(deadline) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(deadline) => {}
                            _ = inner.wake.notified() => continue,
                        }
                        Self::fire_ready(&inner);
                    }
                }
            }
        });
    }

    fn fire_ready(inner: &Arc<Inner>) {
        let now = Instant::now();
        loop {
            let id = {
                let mut queue = inner.queue.lock();
                match queue.peek() {
                    Some(Reverse((deadline, id))) if *deadline <= now => {
                        let id = *id;
                        queue.pop();
                        id
                    }
                    _ => break,
                }
            };

            // Cancelled tasks have no entry and are skipped silently
            let entry = inner.entries.lock().remove(&id);
            match entry {
                None => {}
                Some(Entry::Once(callback)) => {
                    inner.pool.spawn(async move { callback() });
                }
                Some(Entry::Repeating { callback, interval }) => {
                    let fire = callback.clone();
                    inner.pool.spawn(async move { fire() });
                    inner
                        .entries
                        .lock()
                        .insert(id, Entry::Repeating { callback, interval });
                    inner.queue.lock().push(Reverse((now + interval, id)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let scheduler = Scheduler::new(TaskPool::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        scheduler.schedule(Duration::from_millis(40), move || o.lock().push(2));
        let o = order.clone();
        scheduler.schedule(Duration::from_millis(10), move || o.lock().push(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cancel_prevents_invocation() {
        let scheduler = Scheduler::new(TaskPool::new(1));
        let fired = Arc::new(AtomicU32::new(0));

        let f = fired.clone();
        let id = scheduler.schedule(Duration::from_millis(30), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_repeat_until_cancelled() {
        let scheduler = Scheduler::new(TaskPool::new(2));
        let fired = Arc::new(AtomicU32::new(0));

        let f = fired.clone();
        let id = scheduler.repeat(Duration::from_millis(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.cancel(id);
        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 3, "expected several firings, got {count}");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let after = fired.load(Ordering::SeqCst);
        // At most one firing can be in flight at cancel time
        assert!(after <= count + 1);
    }
}
