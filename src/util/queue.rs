//! # Bounded Uplink Queue
//!
//! The per-gateway frame queue between the routing fabric and the
//! packet-forwarder sender loop. A gateway under load prefers fresh radio
//! frames to stale ones, so overflow drops the oldest queued frame rather
//! than the incoming one. Tear-down must not deadlock a blocked consumer:
//! `signal` wakes a waiting `pop` once, `close` terminally.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::logging::log_debug;

/// Fixed-capacity FIFO with drop-oldest overflow and a one-shot wake signal.
#[derive(Debug)]
pub struct UplinkQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    signaled: bool,
    closed: bool,
}

impl<T> UplinkQueue<T> {
    pub fn new(capacity: usize) -> Self {
        UplinkQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                signaled: false,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues an item, discarding the oldest queued item when full.
    /// Pushes onto a closed queue are dropped.
    pub fn push(&self, item: T) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.closed {
                return;
            }
            if state.items.len() == state.capacity {
                state.items.pop_front();
                log_debug("uplink queue full, dropped oldest frame");
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Dequeues the oldest item, waiting until one arrives.
    ///
    /// Returns `None` when woken by `signal` or after `close`, so a
    /// stopping consumer can unwind instead of blocking forever.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.signaled {
                    state.signaled = false;
                    return None;
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wakes one blocked `pop` with `None`. The signal is consumed by the
    /// first waiter (or the first subsequent `pop` on an empty queue).
    pub fn signal(&self) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.signaled = true;
        }
        self.notify.notify_waiters();
    }

    /// Terminally closes the queue; all subsequent pops return `None`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = UplinkQueue::new(3);
        for i in 0..5 {
            queue.push(i);
        }
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, Some(4));
    }

    #[tokio::test]
    async fn signal_unblocks_empty_pop() {
        let queue: Arc<UplinkQueue<u8>> = Arc::new(UplinkQueue::new(4));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.signal();
        let popped = tokio::time::timeout(Duration::from_millis(50), waiter)
            .await
            .expect("pop did not wake")
            .unwrap();
        assert_eq!(popped, None);
    }

    #[tokio::test]
    async fn close_is_terminal() {
        let queue: UplinkQueue<u8> = UplinkQueue::new(4);
        queue.close();
        assert_eq!(queue.pop().await, None);
        assert_eq!(queue.pop().await, None);
        queue.push(1);
        assert_eq!(queue.pop().await, None);
    }
}
