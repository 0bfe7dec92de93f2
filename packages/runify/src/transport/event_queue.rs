// packages/runify/src/transport/event_queue.rs
//! Lock-free MPSC runtime event queue
//!
//! Producers are whatever side of a backend receives runtime output: the
//! stdout reader of a process, the Transport Channel's HTTP handler, or the
//! in-process engine thread. The single consumer is the agent operation
//! currently waiting for its completion. Events keep arrival order.

use crate::protocol::RuntimeEvent;
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// Runtime event queue shared by one agent session
pub struct EventQueue {
    /// Underlying unbounded queue
    queue: SegQueue<RuntimeEvent>,

    /// Wakes the consumer when an event arrives or the queue closes
    notify: Notify,

    /// Set once the producing side has gone away
    closed: AtomicBool,

    /// Push counter
    push_count: AtomicU64,

    /// Pop counter
    pop_count: AtomicU64,

    /// Events refused after close
    drop_count: AtomicU64,
}

impl EventQueue {
    /// Create a new event queue
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push an event (non-blocking, lock-free)
    ///
    /// Returns the event back if the queue has been closed.
    pub fn push(&self, event: RuntimeEvent) -> Result<(), RuntimeEvent> {
        if self.is_closed() {
            self.drop_count.fetch_add(1, Ordering::Relaxed);
            return Err(event);
        }

        self.queue.push(event);
        self.push_count.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        Ok(())
    }

    /// Try to pop an event (non-blocking)
    pub fn try_pop(&self) -> Option<RuntimeEvent> {
        let event = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Wait for the next event
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<RuntimeEvent> {
        loop {
            let notified = self.notify.notified();

            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if self.is_closed() {
                return None;
            }

            notified.await;
        }
    }

    /// Close the queue; already queued events can still be drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get queue statistics
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
        }
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Get current queue length
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue statistics
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Total events pushed
    pub push_count: u64,

    /// Total events popped
    pub pop_count: u64,

    /// Total events refused after close
    pub drop_count: u64,

    /// Current queue size
    pub current_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn print(text: &str) -> RuntimeEvent {
        RuntimeEvent::Print {
            seq: Some(1),
            text: text.to_string(),
        }
    }

    #[test]
    fn test_push_pop_keeps_order() {
        let queue = EventQueue::new();

        queue.push(print("a")).unwrap();
        queue.push(print("b")).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(print("a")));
        assert_eq!(queue.try_pop(), Some(print("b")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_after_close_is_refused() {
        let queue = EventQueue::new();
        queue.close();

        assert!(queue.push(print("late")).is_err());

        let stats = queue.stats();
        assert_eq!(stats.drop_count, 1);
        assert_eq!(stats.push_count, 0);
    }

    #[tokio::test]
    async fn test_pop_waits_for_producer() {
        let queue = Arc::new(EventQueue::new());

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                queue.push(print("late")).unwrap();
            })
        };

        let event = tokio::time::timeout(Duration::from_secs(5), queue.pop())
            .await
            .unwrap();
        assert_eq!(event, Some(print("late")));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let queue = EventQueue::new();
        queue.push(print("last")).unwrap();
        queue.close();

        assert_eq!(queue.pop().await, Some(print("last")));
        assert_eq!(queue.pop().await, None);
    }

    #[test]
    fn test_concurrent_producers() {
        use std::thread;

        let queue = Arc::new(EventQueue::new());
        let mut handles = vec![];

        for i in 0..10 {
            let q = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for j in 0..100 {
                    q.push(print(&format!("{}_{}", i, j))).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.push_count, 1000);
        assert_eq!(stats.current_size, 1000);
    }
}
