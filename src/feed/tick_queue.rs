use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::models::Tick;

/// Bounded single-consumer queue between tick ingestion and aggregation.
///
/// `push` never waits: when full, the oldest tick is discarded so the
/// ingestion side stays O(1) and fresh prices win over stale ones.
pub struct TickQueue {
    inner: Mutex<VecDeque<Tick>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl TickQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a tick. Returns false if the queue is closed.
    pub fn push(&self, tick: Tick) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(tick);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next tick. `None` once closed and drained.
    pub async fn pop(&self) -> Option<Tick> {
        loop {
            {
                let mut queue = match self.inner.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(tick) = queue.pop_front() {
                    return Some(tick);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting ticks; the consumer drains what is left.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn create_test_tick(price: f64) -> Tick {
        Tick {
            instrument: "NIFTY".to_string(),
            price,
            size: 1.0,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TickQueue::new(10);
        queue.push(create_test_tick(1.0));
        queue.push(create_test_tick(2.0));

        assert_eq!(queue.pop().await.map(|t| t.price), Some(1.0));
        assert_eq!(queue.pop().await.map(|t| t.price), Some(2.0));
    }

    #[tokio::test]
    async fn test_drops_oldest_when_full() {
        let queue = TickQueue::new(3);
        for i in 0..5 {
            queue.push(create_test_tick(i as f64));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop().await.map(|t| t.price), Some(2.0));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = TickQueue::new(10);
        queue.push(create_test_tick(1.0));
        queue.close();

        assert!(!queue.push(create_test_tick(2.0)));
        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(TickQueue::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(create_test_tick(42.0));

        let tick = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tick.map(|t| t.price), Some(42.0));
    }
}
