//! Reference Accounting
//!
//! A diagnostic counter that embedding code can hand to a sink so tests can
//! check that no stream, cell or listener outlives its expected scope. Every
//! tracked object increments the counter when it is built and decrements it
//! when it is dropped. It plays no part in propagation.

use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

/// Shared live-object counter.
///
/// Clones share the same count.
#[derive(Clone, Default)]
pub struct MemReferences {
    count: Arc<AtomicIsize>,
}

impl MemReferences {
    /// Create a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked objects currently alive.
    pub fn count(&self) -> isize {
        self.count.load(Ordering::SeqCst)
    }

    /// Record one more live object.
    pub fn add_ref(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Record that a live object went away.
    pub fn release(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemReferences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemReferences")
            .field("count", &self.count())
            .finish()
    }
}

/// Token embedded in tracked objects: counts up on creation, down on drop.
pub(crate) struct Tracked {
    refs: Option<MemReferences>,
}

impl Tracked {
    pub(crate) fn new(refs: Option<MemReferences>) -> Self {
        if let Some(refs) = &refs {
            refs.add_ref();
        }
        Self { refs }
    }

    pub(crate) fn refs(&self) -> Option<MemReferences> {
        self.refs.clone()
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        if let Some(refs) = &self.refs {
            refs.release();
        }
    }
}
