//! Fixed-capacity FIFO buffer.
//!
//! The queue never blocks: [`BoundedQueue::offer`] reports a full queue with
//! `false`, [`BoundedQueue::add`] with a [`GovernanceError::QueueFull`]. It has
//! no internal locking; the registry in [`crate::governance::manager`] wraps
//! shared queues in a mutex.

use std::collections::VecDeque;

use serde::Serialize;

use crate::error::{GovernanceError, GovernanceResult};

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub full: bool,
}

#[derive(Debug, Clone)]
pub struct BoundedQueue<T> {
    name: String,
    capacity: usize,
    buffer: VecDeque<T>,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            buffer: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append `item` unless the queue is full. Never mutates a full queue.
    pub fn offer(&mut self, item: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.buffer.push_back(item);
        true
    }

    /// Append `item`, failing with [`GovernanceError::QueueFull`] when at capacity.
    pub fn add(&mut self, item: T) -> GovernanceResult<()> {
        if self.offer(item) {
            Ok(())
        } else {
            Err(GovernanceError::QueueFull {
                name: self.name.clone(),
                max: self.capacity,
            })
        }
    }

    pub fn poll(&mut self) -> Option<T> {
        self.buffer.pop_front()
    }

    pub fn peek(&self) -> Option<&T> {
        self.buffer.front()
    }

    /// Front-to-back view that does not consume the queue.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buffer.iter()
    }

    /// Remove every element, front first.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.buffer.drain(..)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buffer.len())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            size: self.len(),
            max_size: self.capacity,
            full: self.is_full(),
        }
    }
}

impl<'a, T> IntoIterator for &'a BoundedQueue<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.iter()
    }
}
