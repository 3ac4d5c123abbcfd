//! FIFO of arena indices

use std::collections::VecDeque;

/// Ordered queue of arena indices.
///
/// Holds no payload itself; records live in the owning arena and are only
/// referenced here, so membership can change without moving them.
#[derive(Debug, Clone, Default)]
pub struct IndexFifo {
    items: VecDeque<usize>,
}

impl IndexFifo {
    /// Create an empty queue with room for `capacity` entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// Append to the tail
    pub fn push(&mut self, index: usize) {
        self.items.push_back(index);
    }

    /// Remove from the head, `None` when empty
    pub fn pop(&mut self) -> Option<usize> {
        self.items.pop_front()
    }

    /// Look at the head without removing it
    pub fn peek(&self) -> Option<usize> {
        self.items.front().copied()
    }

    /// Remove a specific index wherever it sits; returns whether it was present
    pub fn remove(&mut self, index: usize) -> bool {
        match self.items.iter().position(|&i| i == index) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.items.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take every entry, head first
    pub fn drain(&mut self) -> Vec<usize> {
        self.items.drain(..).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.items.iter().copied()
    }
}
