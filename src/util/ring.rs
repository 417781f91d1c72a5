//! # Overwriting Ring Buffer
//!
//! Fixed-capacity window over a stream of items. When full, a push evicts
//! the oldest item. This is the storage behind per-topic event history:
//! late subscribers replay the retained window in insertion order.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A fixed-capacity overwriting queue.
///
/// Safe for concurrent pushers and readers; `snapshot` observes a
/// consistent point-in-time prefix. Pushes never block and never allocate
/// beyond slot reuse once the buffer has filled.
#[derive(Debug)]
pub struct RingBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Creates a ring with the given capacity. A capacity of zero retains
    /// nothing (every push is immediately discarded).
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends an item, overwriting the oldest when full.
    pub fn push(&self, item: T) {
        if self.capacity == 0 {
            return;
        }
        let mut items = self.inner.lock().expect("ring lock poisoned");
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    /// Returns the retained items, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        let items = self.inner.lock().expect("ring lock poisoned");
        items.iter().cloned().collect()
    }

    /// Number of retained items.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring lock poisoned").len()
    }

    /// True when nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of retained items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_below_capacity_keeps_all() {
        let ring = RingBuffer::new(4);
        for i in 0..3 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(), vec![0, 1, 2]);
    }

    #[test]
    fn push_past_capacity_overwrites_oldest() {
        let ring = RingBuffer::new(3);
        for i in 0..10 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(), vec![7, 8, 9]);
    }

    #[test]
    fn zero_capacity_retains_nothing() {
        let ring = RingBuffer::new(0);
        ring.push(1);
        assert!(ring.is_empty());
    }
}
