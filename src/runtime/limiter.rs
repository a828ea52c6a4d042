use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Bounds how many generation tasks run at once for one integration.
///
/// Admission is strictly FIFO: the fair semaphore releases waiters in
/// arrival order. A task's panic or error never poisons the limiter;
/// its slot is returned when the future settles either way.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    limit: usize,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            active: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs `task` once a slot frees up and returns its output unchanged.
    pub async fn schedule<T, F>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("limiter semaphore is never closed");
        self.active.fetch_add(1, Ordering::SeqCst);
        let output = task.await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        output
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let limiter = ConcurrencyLimiter::new(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let peak = Arc::clone(&peak);
            let running = Arc::clone(&running);
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(limiter.active_count(), 0);
    }

    #[tokio::test]
    async fn releases_waiters_in_arrival_order() {
        let limiter = ConcurrencyLimiter::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..4u32 {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(async move {
                        order.lock().expect("order lock").push(n);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    })
                    .await;
            }));
            // Give each submitter time to reach the queue before the next.
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }

        assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn a_failing_task_frees_its_slot() {
        let limiter = ConcurrencyLimiter::new(1);

        let failed: Result<(), &str> = limiter.schedule(async { Err("vendor refused") }).await;
        assert!(failed.is_err());

        let ok: Result<(), &str> = limiter.schedule(async { Ok(()) }).await;
        assert!(ok.is_ok());
        assert_eq!(limiter.active_count(), 0);
    }
}
