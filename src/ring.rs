//! Fixed-capacity FIFO sample window.

use std::collections::VecDeque;

/// A bounded window that keeps the most recent `capacity` samples in
/// arrival order, evicting the oldest on overflow.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Creates an empty window holding at most `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest one when full.
    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

impl RingBuffer<f64> {
    /// Arithmetic mean, or `0.0` when empty.
    pub fn mean(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.items.iter().sum::<f64>() / self.items.len() as f64
    }
}

impl RingBuffer<bool> {
    /// Fraction of `true` samples, or `0.0` when empty.
    pub fn true_ratio(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.items.iter().filter(|ok| **ok).count() as f64 / self.items.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_exceeds_capacity_and_keeps_newest() {
        let mut ring = RingBuffer::new(50);
        for i in 0..173 {
            ring.push(i);
            assert!(ring.len() <= 50);
        }
        let kept: Vec<i32> = ring.iter().copied().collect();
        assert_eq!(kept, (123..173).collect::<Vec<_>>());
    }

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(RingBuffer::<f64>::new(5).mean(), 0.0);
    }

    #[test]
    fn true_ratio_counts_successes() {
        let mut ring = RingBuffer::new(5);
        [true, true, false, true, true]
            .into_iter()
            .for_each(|ok| ring.push(ok));
        assert_eq!(ring.true_ratio(), 0.8);
    }

    #[test]
    fn zero_capacity_stays_empty() {
        let mut ring = RingBuffer::new(0);
        ring.push(1.0);
        assert!(ring.is_empty());
    }
}
