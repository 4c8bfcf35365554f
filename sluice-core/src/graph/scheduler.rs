//! Priority Queue
//!
//! The ordered work-list that feeds a transaction. Work is keyed by
//! `(rank, sequence)`: lowest rank first, and among equal ranks the entry
//! scheduled first runs first. The sequence number is process-wide and
//! strictly increasing, so two keys never compare equal.
//!
//! The queue only holds keys. The transaction owns the actions themselves
//! and can throw the queue away and rebuild it whenever ranks move.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ordering key of one scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryKey {
    /// Rank of the target node when the key was pushed.
    pub rank: u64,
    /// Scheduling sequence number.
    pub seq: u64,
}

impl EntryKey {
    /// Build a key for a fresh entry, drawing the next sequence number.
    pub fn next(rank: u64) -> Self {
        static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);
        Self {
            rank,
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// Min-queue of entry keys.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Reverse<EntryKey>>,
}

impl PriorityQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key.
    pub fn push(&mut self, key: EntryKey) {
        self.heap.push(Reverse(key));
    }

    /// Remove and return the smallest key.
    pub fn pop(&mut self) -> Option<EntryKey> {
        self.heap.pop().map(|Reverse(key)| key)
    }

    /// Drop every key.
    pub fn clear(&mut self) {
        self.heap.clear();
    }

    /// Number of queued keys.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
