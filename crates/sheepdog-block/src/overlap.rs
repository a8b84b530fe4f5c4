//! Serialization of operations that touch the same objects.
//!
//! The daemon gives no ordering between requests, and a copy-on-write
//! decision reads and then updates the same owner table entry, so two
//! operations whose object index ranges intersect must not be in flight
//! together.

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

/// Tracks the object index ranges of running operations.
pub(crate) struct OverlapSerializer {
    running: Mutex<Vec<(u64, u64, u64)>>,
    wakeup: Notify,
}

/// Keeps an operation's range registered until dropped.
pub(crate) struct OverlapGuard<'a> {
    serializer: &'a OverlapSerializer,
    op_id: u64,
}

impl OverlapSerializer {
    pub(crate) fn new() -> Self {
        Self {
            running: Mutex::new(Vec::new()),
            wakeup: Notify::new(),
        }
    }

    fn try_register(&self, op_id: u64, min: u64, max: u64) -> bool {
        let mut running = self.running.lock();
        if running.iter().any(|&(_, lo, hi)| !(hi < min || max < lo)) {
            return false;
        }
        running.push((op_id, min, max));
        true
    }

    /// Wait until no running operation intersects `[min, max]`, then
    /// register the range.
    pub(crate) async fn acquire(&self, op_id: u64, min: u64, max: u64) -> OverlapGuard<'_> {
        loop {
            let notified = self.wakeup.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_register(op_id, min, max) {
                return OverlapGuard {
                    serializer: self,
                    op_id,
                };
            }
            debug!("op {} [{}, {}] waits for an overlapping op", op_id, min, max);
            notified.await;
        }
    }

    fn release(&self, op_id: u64) {
        self.running.lock().retain(|&(id, _, _)| id != op_id);
        self.wakeup.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        self.running.lock().len()
    }
}

impl Drop for OverlapGuard<'_> {
    fn drop(&mut self) {
        self.serializer.release(self.op_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_disjoint_ranges_run_together() {
        let s = OverlapSerializer::new();
        let _a = s.acquire(1, 0, 2).await;
        let _b = s.acquire(2, 3, 5).await;
        assert_eq!(s.running(), 2);
    }

    #[tokio::test]
    async fn test_overlapping_range_waits_for_release() {
        let s = Arc::new(OverlapSerializer::new());
        let first = s.acquire(1, 0, 2).await;

        let s2 = Arc::clone(&s);
        let waiter = tokio::spawn(async move {
            let _g = s2.acquire(2, 2, 4).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(s.running(), 1);

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s.running(), 0);
    }

    #[tokio::test]
    async fn test_release_wakes_every_runnable_waiter() {
        let s = Arc::new(OverlapSerializer::new());
        let wide = s.acquire(1, 0, 10).await;

        let mut waiters = Vec::new();
        for (id, idx) in [(2u64, 1u64), (3, 5), (4, 9)] {
            let s = Arc::clone(&s);
            waiters.push(tokio::spawn(async move {
                let _g = s.acquire(id, idx, idx).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(wide);
        for w in waiters {
            tokio::time::timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        }
    }
}
