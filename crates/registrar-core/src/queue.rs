//! Bounded multi-producer multi-consumer work queue.
//!
//! Producers push synchronously and learn immediately when the queue is
//! full (the caller answers 480). A semaphore wakes idle workers; each
//! worker runs one item to completion before taking the next.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Semaphore;

pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    signal: Semaphore,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            signal: Semaphore::new(0),
            capacity,
        }
    }

    /// Push an item, returning it back when the queue is at capacity.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock().expect("queue poisoned");
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.signal.add_permits(1);
        Ok(())
    }

    /// Wait for the next item. Returns `None` once the queue is closed and
    /// drained, which is the workers' signal to exit.
    pub async fn pop(&self) -> Option<T> {
        match self.signal.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => {
                // Closed: drain whatever is left before reporting empty.
                return self.items.lock().expect("queue poisoned").pop_front();
            }
        }
        self.items.lock().expect("queue poisoned").pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().expect("queue poisoned").len()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue. Blocked workers wake up and drain remaining items.
    pub fn close(&self) {
        self.signal.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn push_pop_in_order() {
        let queue = WorkQueue::new(4);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let queue = WorkQueue::new(2);
        queue.try_push(1).unwrap();
        queue.try_push(2).unwrap();
        assert_eq!(queue.try_push(3), Err(3));
    }

    #[tokio::test]
    async fn close_wakes_waiting_worker() {
        let queue = Arc::new(WorkQueue::<u32>::new(2));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.close();
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn multiple_workers_share_items() {
        let queue = Arc::new(WorkQueue::new(16));
        for i in 0..16 {
            queue.try_push(i).unwrap();
        }
        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = queue.pop().await {
                    seen.push(item);
                }
                seen
            }));
        }
        queue.close();
        let mut all: Vec<u32> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..16).collect::<Vec<_>>());
    }
}
