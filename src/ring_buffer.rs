//! A growable circular buffer used to stage photons between reading and
//! processing them.
//!
//! The logical window is `[left_index, right_index]`, where `left_index` is a
//! physical slot and `right_index` is allowed to run past the end of the
//! backing store (physical slot is taken modulo the capacity). Since one
//! element and a buffer about to wrap look identical from the indices alone,
//! an explicit `empty` flag marks the empty state.

use std::cmp::Ordering;

use crate::QueueError;

#[derive(Clone, Debug)]
pub struct RingBuffer<T> {
    values: Vec<T>,
    empty: bool,
    left_index: usize,
    right_index: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Allocates a buffer with room for `capacity` elements. A capacity of
    /// zero is promoted to one so that doubling can make progress.
    pub fn with_capacity(capacity: usize) -> Result<Self, QueueError> {
        let capacity = capacity.max(1);
        let mut values = Vec::new();
        values
            .try_reserve_exact(capacity)
            .map_err(|_| QueueError::OutOfMemory { capacity })?;
        values.resize(capacity, T::default());
        Ok(RingBuffer {
            values,
            empty: true,
            left_index: 0,
            right_index: 0,
        })
    }

    pub fn size(&self) -> usize {
        if self.empty {
            0
        } else {
            self.right_index - self.left_index + 1
        }
    }

    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity()
    }

    /// Forgets all elements while keeping the allocation.
    pub fn clear(&mut self) {
        self.empty = true;
        self.left_index = 0;
        self.right_index = 0;
    }

    /// Appends an element, doubling the capacity first if the buffer is
    /// full. Nothing already queued is ever overwritten.
    pub fn push(&mut self, value: T) -> Result<(), QueueError> {
        if self.is_full() {
            warn!(
                "Queue needs to be expanded beyond {} elements. Consider a larger initial queue size.",
                self.capacity()
            );
            self.grow()?;
        }

        if self.empty {
            self.left_index = 0;
            self.right_index = 0;
            self.values[0] = value;
            self.empty = false;
        } else {
            self.right_index += 1;
            let slot = self.right_index % self.capacity();
            self.values[slot] = value;
        }
        Ok(())
    }

    /// Removes and returns the oldest element.
    pub fn pop(&mut self) -> Result<T, QueueError> {
        let value = *self.front()?;
        if self.left_index == self.right_index {
            self.clear();
        } else {
            self.left_index += 1;
            if self.left_index == self.capacity() {
                self.left_index -= self.capacity();
                self.right_index -= self.capacity();
            }
        }
        Ok(value)
    }

    /// Element at logical offset `index` from the front.
    pub fn index(&self, index: usize) -> Result<&T, QueueError> {
        let size = self.size();
        if index >= size {
            return Err(QueueError::IndexOutOfRange { index, size });
        }
        Ok(&self.values[(self.left_index + index) % self.capacity()])
    }

    pub fn front(&self) -> Result<&T, QueueError> {
        if self.empty {
            return Err(QueueError::Empty);
        }
        self.index(0)
    }

    pub fn back(&self) -> Result<&T, QueueError> {
        if self.empty {
            return Err(QueueError::Empty);
        }
        self.index(self.size() - 1)
    }

    /// Iterates from the oldest to the newest element.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + '_ {
        (0..self.size()).map(move |i| &self.values[(self.left_index + i) % self.capacity()])
    }

    /// Sorts the queued elements in place.
    ///
    /// The window is first made contiguous at the start of the backing
    /// store (rotating a wrapped window, shifting an offset one), after which
    /// the slice is sorted and `left_index` is reset to zero.
    pub fn sort_by<F>(&mut self, compare: F)
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        if self.empty {
            return;
        }
        let size = self.size();
        let right = self.right_index % self.capacity();
        let left = self.left_index;

        if right < left || size == self.capacity() {
            debug!("Queue wraps around, rotating it to make it contiguous");
            self.values.rotate_left(left);
        } else if left != 0 {
            debug!("Queue is offset from the beginning, moving it forward");
            self.values.copy_within(left..=right, 0);
        }

        self.left_index = 0;
        self.right_index = size - 1;
        self.values[..size].sort_by(compare);
    }

    pub fn sort(&mut self)
    where
        T: Ord,
    {
        self.sort_by(|a, b| a.cmp(b))
    }

    /// Doubles the backing store, laying the window out from slot zero.
    fn grow(&mut self) -> Result<(), QueueError> {
        let capacity = self.capacity();
        let new_capacity = capacity
            .checked_mul(2)
            .ok_or(QueueError::OutOfMemory { capacity })?;
        debug!("Growing queue from {} to {}", capacity, new_capacity);

        let mut values = Vec::new();
        values
            .try_reserve_exact(new_capacity)
            .map_err(|_| QueueError::OutOfMemory { capacity })?;
        values.extend(self.iter().copied());
        let size = values.len();
        values.resize(new_capacity, T::default());

        self.values = values;
        self.left_index = 0;
        self.right_index = size.saturating_sub(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn push_pop_in_order() {
        let mut queue = RingBuffer::with_capacity(3).unwrap();
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.size(), 3);
        assert!(queue.is_full());
        assert_eq!(*queue.front().unwrap(), 0);
        assert_eq!(*queue.back().unwrap(), 2);
        assert_eq!(queue.pop().unwrap(), 0);
        queue.push(3).unwrap();
        assert_eq!(queue.capacity(), 3);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_queue_errors() {
        let mut queue = RingBuffer::<i32>::with_capacity(4).unwrap();
        assert_eq!(queue.pop(), Err(QueueError::Empty));
        assert_eq!(queue.front(), Err(QueueError::Empty));
        assert_eq!(queue.back(), Err(QueueError::Empty));
        queue.push(1).unwrap();
        assert_eq!(
            queue.index(1),
            Err(QueueError::IndexOutOfRange { index: 1, size: 1 })
        );
    }

    #[test]
    fn zero_capacity_is_promoted() {
        let mut queue = RingBuffer::with_capacity(0).unwrap();
        assert_eq!(queue.capacity(), 1);
        queue.push(7u8).unwrap();
        queue.push(8u8).unwrap();
        assert_eq!(queue.capacity(), 2);
        assert_eq!(queue.pop().unwrap(), 7);
        assert_eq!(queue.pop().unwrap(), 8);
        assert!(queue.is_empty());
    }

    #[test]
    fn growth_keeps_wrapped_elements() {
        let mut queue = RingBuffer::with_capacity(4).unwrap();
        for i in 0..4 {
            queue.push(i).unwrap();
        }
        queue.pop().unwrap();
        queue.pop().unwrap();
        queue.push(4).unwrap();
        queue.push(5).unwrap();
        // Window now wraps around the end of the store
        let before = queue.capacity();
        queue.push(6).unwrap();
        assert!(queue.capacity() >= 2 * before);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn random_operations_match_a_deque() {
        let mut rng = StdRng::seed_from_u64(7);
        for capacity in 1..8 {
            let mut queue = RingBuffer::with_capacity(capacity).unwrap();
            let mut reference = VecDeque::new();
            for step in 0..2000 {
                if rng.gen_bool(0.55) || reference.is_empty() {
                    queue.push(step).unwrap();
                    reference.push_back(step);
                } else {
                    assert_eq!(queue.pop().unwrap(), reference.pop_front().unwrap());
                }
                assert_eq!(queue.size(), reference.len());
                assert!(queue.size() <= queue.capacity());
                if let Some(front) = reference.front() {
                    assert_eq!(queue.front().unwrap(), front);
                    assert_eq!(queue.back().unwrap(), reference.back().unwrap());
                }
            }
        }
    }

    #[test]
    fn sort_wrapped_window() {
        let mut queue = RingBuffer::with_capacity(6).unwrap();
        for v in [9, 9, 9, 9, 5, 1] {
            queue.push(v).unwrap();
        }
        for _ in 0..4 {
            queue.pop().unwrap();
        }
        for v in [8, 3, 7] {
            queue.push(v).unwrap();
        }
        queue.sort();
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5, 7, 8]);
        assert_eq!(*queue.front().unwrap(), 1);
        queue.push(0).unwrap();
        assert_eq!(*queue.back().unwrap(), 0);
    }

    #[test]
    fn sort_offset_window() {
        let mut queue = RingBuffer::with_capacity(8).unwrap();
        for v in [0, 0, 4, 2, 3] {
            queue.push(v).unwrap();
        }
        queue.pop().unwrap();
        queue.pop().unwrap();
        queue.sort();
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn sort_preserves_content_for_random_input() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let mut queue = RingBuffer::with_capacity(rng.gen_range(1..16)).unwrap();
            let mut reference = Vec::new();
            for _ in 0..rng.gen_range(0..40) {
                let v: i16 = rng.gen();
                queue.push(v).unwrap();
                reference.push(v);
            }
            for _ in 0..rng.gen_range(0..=reference.len()) {
                queue.pop().unwrap();
                reference.remove(0);
            }
            queue.sort_by(|a, b| b.cmp(a));
            reference.sort_by(|a, b| b.cmp(a));
            assert_eq!(queue.iter().copied().collect::<Vec<_>>(), reference);
        }
    }
}
