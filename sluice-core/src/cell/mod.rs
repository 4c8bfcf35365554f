//! Cells
//!
//! A [`Cell`] is a value that changes over time. It is fed by a stream of
//! updates and always has a current value.
//!
//! # Consistency
//!
//! An update is staged when the stream fires and committed in the
//! transaction's last phase. Until then every sample in the transaction sees
//! the value as it was when the transaction started. Derived cells therefore
//! never expose a half-updated state: mid-transaction everything reads the old
//! state, and after the transaction everything reads the new one.
//!
//! # Design Decisions
//!
//! 1. The initial value may be lazy. It is computed the first time the cell
//!    is sampled, which lets a cell be defined in terms of a value that only
//!    exists once a loop is resolved.
//!
//! 2. The cell listens to its stream through the null node, so holding a
//!    stream never raises any rank.

mod lift;
mod looping;
mod sink;

pub use lift::CellFn;
pub use looping::CellLoop;
pub use sink::CellSink;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::graph::null_node;
use crate::lazy::Lazy;
use crate::listener::Listener;
use crate::memory::{MemReferences, Tracked};
use crate::stream::Stream;
use crate::transaction::Transaction;
use crate::Value;

/// A cell's current value, possibly not computed yet.
pub(crate) enum CellValue<T> {
    Ready(T),
    Pending(Lazy<T>),
}

struct CellInner<T> {
    stream: Stream<T>,
    value: Mutex<CellValue<T>>,
    update: Mutex<Option<T>>,
    _cleanup: Listener,
    _tracked: Tracked,
}

impl<T: Value> CellInner<T> {
    fn commit(&self) {
        let Some(update) = self.update.lock().take() else {
            return;
        };
        let previous = std::mem::replace(&mut *self.value.lock(), CellValue::Ready(update));
        drop(previous);
    }
}

/// A value that changes over time.
///
/// Cloning yields another handle to the same cell.
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

/// Non-owning handle to a [`Cell`].
pub struct WeakCell<T> {
    inner: Weak<CellInner<T>>,
}

enum LazySample<T> {
    Waiting(Cell<T>),
    Resolved(T),
}

impl<T: Value> Cell<T> {
    /// A cell that never changes.
    pub fn constant(value: T) -> Self {
        Stream::never().hold(value)
    }

    /// A cell that never changes, with its value computed on first sample.
    pub fn constant_lazy(value: Lazy<T>) -> Self {
        Stream::never().hold_lazy(value)
    }

    /// Build a cell holding `value` and updated by `stream`.
    pub(crate) fn build(trans: &Transaction, stream: Stream<T>, value: CellValue<T>) -> Self {
        let refs = stream.refs();
        let inner = Arc::new_cyclic(|weak: &Weak<CellInner<T>>| {
            let target = Weak::clone(weak);
            let cleanup = stream.listen_with(
                null_node(),
                trans,
                Arc::new(move |trans: &Transaction, value: &T| {
                    let Some(cell) = target.upgrade() else {
                        return;
                    };
                    let first = cell.update.lock().replace(value.clone()).is_none();
                    if first {
                        let pending = Arc::downgrade(&cell);
                        trans.run_last(move || {
                            if let Some(cell) = pending.upgrade() {
                                cell.commit();
                            }
                        });
                    }
                }),
                false,
            );
            CellInner {
                stream,
                value: Mutex::new(value),
                update: Mutex::new(None),
                _cleanup: cleanup,
                _tracked: Tracked::new(refs),
            }
        });
        Self { inner }
    }

    pub(crate) fn refs(&self) -> Option<MemReferences> {
        self.inner.stream.refs()
    }

    /// The current value.
    ///
    /// Inside a transaction this is the value as of the start of that
    /// transaction.
    pub fn sample(&self) -> T {
        Transaction::apply(|_| self.sample_no_transaction())
    }

    /// The current value, without taking the transaction lock.
    pub(crate) fn sample_no_transaction(&self) -> T {
        let seed = match &*self.inner.value.lock() {
            CellValue::Ready(value) => return value.clone(),
            CellValue::Pending(lazy) => lazy.clone(),
        };

        // computing the seed may sample other cells, so no lock is held here
        let value = seed.get();

        let mut current = self.inner.value.lock();
        if let CellValue::Ready(committed) = &*current {
            return committed.clone();
        }
        let previous = std::mem::replace(&mut *current, CellValue::Ready(value.clone()));
        drop(current);
        drop(previous);
        value
    }

    /// The value this cell will hold once `trans` has committed.
    ///
    /// Reading the result before the transaction's last phase yields the
    /// current value.
    pub fn sample_lazy(&self, trans: &Transaction) -> Lazy<T> {
        let slot = Arc::new(Mutex::new(LazySample::Waiting(self.clone())));
        let resolve = Arc::clone(&slot);
        trans.run_last(move || {
            let waiting = {
                let guard = resolve.lock();
                match &*guard {
                    LazySample::Waiting(cell) => cell.clone(),
                    LazySample::Resolved(_) => return,
                }
            };
            let value = waiting.latest();
            let previous = std::mem::replace(&mut *resolve.lock(), LazySample::Resolved(value));
            drop(previous);
        });

        Lazy::new(move || {
            let waiting = match &*slot.lock() {
                LazySample::Resolved(value) => return value.clone(),
                LazySample::Waiting(cell) => cell.clone(),
            };
            waiting.sample_no_transaction()
        })
    }

    /// The staged update if there is one, else the current value.
    fn latest(&self) -> T {
        let staged = self.inner.update.lock().clone();
        staged.unwrap_or_else(|| self.sample_no_transaction())
    }

    /// Replace a lazy seed that has not been computed yet.
    pub(crate) fn reseed(&self, value: Lazy<T>) {
        let mut current = self.inner.value.lock();
        if let CellValue::Pending(_) = &*current {
            let previous = std::mem::replace(&mut *current, CellValue::Pending(value));
            drop(current);
            drop(previous);
        }
    }

    /// The stream of this cell's updates.
    ///
    /// Exposes individual steps, which sampling never shows; see
    /// [`crate::operational`].
    pub fn updates(&self) -> Stream<T> {
        self.inner.stream.clone()
    }

    /// A stream that fires the current value in `trans`, then every update.
    pub fn value(&self, trans: &Transaction) -> Stream<T> {
        let spark: Stream<()> = Stream::with_refs(self.refs());
        let fire = spark.clone();
        trans.schedule(spark.rank(), move |trans| fire.send(trans, ()));
        let initial = spark.snapshot1(self);
        initial.merge(&self.inner.stream, |_, update| update.clone())
    }

    /// Call `handler` with the current value and then with every update.
    pub fn listen(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Listener {
        Transaction::apply(|trans| self.value(trans).listen(handler))
    }

    /// Call `handler` with the current value only.
    pub fn listen_once(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Listener {
        Transaction::apply(|trans| self.value(trans).listen_once(handler))
    }

    /// A cell holding `f` applied to this cell's value.
    pub fn map<U: Value>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> Cell<U> {
        let f = Arc::new(f);
        Transaction::apply(|trans| {
            let seed_fn = Arc::clone(&f);
            let seed = self.sample_lazy(trans).map(move |value| seed_fn(&value));
            self.inner.stream.map(move |value| f(value)).hold_lazy(seed)
        })
    }

    /// A handle that does not keep the cell alive.
    pub fn downgrade(&self) -> WeakCell<T> {
        WeakCell {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T: Value + PartialEq> Cell<T> {
    /// A cell that skips updates equal to its current value.
    pub fn calm(&self) -> Cell<T> {
        Transaction::apply(|trans| {
            let initial = self.sample_lazy(trans);
            let last = initial.map(Some);
            self.inner.stream.calm_lazy(last).hold_lazy(initial)
        })
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = matches!(&*self.inner.value.lock(), CellValue::Pending(_));
        f.debug_struct("Cell")
            .field("stream", &self.inner.stream)
            .field("pending_seed", &pending)
            .finish()
    }
}

impl<T> WeakCell<T> {
    /// Recover a strong handle if the cell is still alive.
    pub fn upgrade(&self) -> Option<Cell<T>> {
        self.inner.upgrade().map(|inner| Cell { inner })
    }
}

impl<T> Clone for WeakCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WeakCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCell")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
