//! Clock-domain-crossing queues
//!
//! The transmit and receive sides run as independent sequencers. Anything
//! handed from one to the other goes through a bounded single-producer,
//! single-consumer queue: words arrive whole and in order, and a full queue
//! pushes back on the producer instead of dropping.

use heapless::spsc::Queue;

/// Bounded SPSC queue holding up to `N - 1` entries
pub struct CdcFifo<T, const N: usize> {
    queue: Queue<T, N>,
}

impl<T, const N: usize> CdcFifo<T, N> {
    /// An empty queue
    pub const fn new() -> Self {
        Self {
            queue: Queue::new(),
        }
    }

    /// Enqueue, handing the item back when the queue is full
    pub fn try_push(&mut self, item: T) -> Result<(), T> {
        self.queue.enqueue(item)
    }

    /// Dequeue the oldest entry
    pub fn try_pop(&mut self) -> Option<T> {
        self.queue.dequeue()
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Whether a push would be refused
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Free entries left
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        while self.queue.dequeue().is_some() {}
    }
}

impl<T, const N: usize> Default for CdcFifo<T, N> {
    fn default() -> Self {
        Self::new()
    }
}
