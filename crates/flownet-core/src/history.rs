//! Bounded ring buffers for transfer and process history.

use crate::fixed::{Fixed64, Ticks};
use crate::id::{ConnectionId, NodeId, ResourceType};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// A pre-allocated ring buffer. Fixed capacity; when full, the oldest entry
/// is dropped.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    /// Pre-allocated storage.
    slots: Vec<Option<T>>,
    /// Write position (wraps around).
    head: usize,
    /// Number of entries currently stored.
    len: usize,
    /// Total entries ever written (including dropped).
    total_written: u64,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the given capacity.
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_written: 0,
        }
    }

    /// Push an entry. If full, the oldest entry is dropped.
    pub fn push(&mut self, value: T) {
        self.slots[self.head] = Some(value);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_written += 1;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total entries written since creation (including dropped).
    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    /// Number of entries dropped because the buffer was full.
    pub fn dropped_count(&self) -> u64 {
        self.total_written.saturating_sub(self.capacity() as u64)
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> RingBufferIter<'_, T> {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        RingBufferIter {
            buffer: self,
            index: start,
            remaining: self.len,
        }
    }

    /// The most recently pushed entry.
    pub fn latest(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head + self.capacity() - 1) % self.capacity();
        self.slots[idx].as_ref()
    }

    /// Clear all entries. The lifetime write counter is kept.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.head = 0;
        self.len = 0;
    }

    /// Rebuild with a new capacity, keeping the newest entries that fit.
    pub fn resize(&mut self, capacity: usize)
    where
        T: Clone,
    {
        if capacity.max(1) == self.capacity() {
            return;
        }
        let mut resized = RingBuffer::new(capacity);
        for value in self.iter() {
            resized.push(value.clone());
        }
        resized.total_written = self.total_written;
        *self = resized;
    }
}

/// Iterator over a [`RingBuffer`], from oldest to newest.
pub struct RingBufferIter<'a, T> {
    buffer: &'a RingBuffer<T>,
    index: usize,
    remaining: usize,
}

impl<'a, T> Iterator for RingBufferIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let value = self.buffer.slots[self.index].as_ref();
        self.index = (self.index + 1) % self.buffer.capacity();
        self.remaining -= 1;
        value
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<T> ExactSizeIterator for RingBufferIter<'_, T> {}

// ---------------------------------------------------------------------------
// Transfer records
// ---------------------------------------------------------------------------

/// Where a transfer record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferOrigin {
    /// Rate assigned to a connection by the optimizer.
    Optimized,
    /// An explicit transfer that reached its target.
    Delivered,
}

/// One movement (planned or delivered) of a resource between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub resource: ResourceType,
    pub source: NodeId,
    pub target: NodeId,
    pub amount: Fixed64,
    pub timestamp: Ticks,
    pub connection: Option<ConnectionId>,
    pub origin: TransferOrigin,
}

/// Bounded history of transfers, oldest evicted first.
pub type TransferHistory = RingBuffer<TransferRecord>;
