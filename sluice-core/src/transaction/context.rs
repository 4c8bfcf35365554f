//! Transaction Context
//!
//! Thread-local bookkeeping for the transaction that is currently open and for
//! whether user code is running inside a propagation callback.
//!
//! # Implementation
//!
//! Only the thread holding the process-wide transaction lock can open a
//! transaction, so a thread-local slot is enough to hold "the" current
//! transaction. Both pieces of state are changed through RAII guards, which
//! keeps them consistent even if a callback panics.

use std::cell::{Cell, RefCell};

use super::Transaction;

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
    static CALLBACK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// The transaction open on this thread, if any.
pub(crate) fn current() -> Option<Transaction> {
    CURRENT.with(|slot| slot.borrow().clone())
}

/// Guard that installs a transaction (or none) as current and restores the
/// previous one when dropped.
pub(crate) struct CurrentSwap {
    previous: Option<Transaction>,
}

impl CurrentSwap {
    pub(crate) fn install(trans: Option<Transaction>) -> Self {
        let previous = CURRENT.with(|slot| slot.replace(trans));
        Self { previous }
    }
}

impl Drop for CurrentSwap {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|slot| {
            *slot.borrow_mut() = previous;
        });
    }
}

/// Marks the current thread as running a propagation callback.
///
/// Sinks refuse `send` while any guard is alive, because a send from inside
/// propagation would start unbounded reentrant propagation on the same
/// timeline.
pub(crate) struct CallbackGuard {
    depth: usize,
}

impl CallbackGuard {
    /// Enter a callback. The callback ends when the guard is dropped.
    pub(crate) fn enter() -> Self {
        let depth = CALLBACK_DEPTH.with(|d| {
            let next = d.get() + 1;
            d.set(next);
            next
        });
        Self { depth }
    }

    /// Whether a callback is running on this thread.
    pub(crate) fn is_active() -> bool {
        Self::depth() > 0
    }

    /// How many callbacks are nested on this thread.
    pub(crate) fn depth() -> usize {
        CALLBACK_DEPTH.with(Cell::get)
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        CALLBACK_DEPTH.with(|d| {
            debug_assert_eq!(
                d.get(),
                self.depth,
                "CallbackGuard mismatch: expected depth {}, got {}",
                self.depth,
                d.get()
            );
            d.set(self.depth - 1);
        });
    }
}
