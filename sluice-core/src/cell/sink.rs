//! Writable cells.

use std::fmt;
use std::ops::Deref;

use super::{Cell, CellValue};
use crate::error::Result;
use crate::memory::MemReferences;
use crate::stream::StreamSink;
use crate::transaction::Transaction;
use crate::Value;

/// A cell that external code can set.
///
/// Several sends in one transaction keep the last value unless a fold
/// function is given.
pub struct CellSink<T> {
    cell: Cell<T>,
    sink: StreamSink<T>,
}

impl<T: Value> CellSink<T> {
    /// A cell starting at `initial`.
    pub fn new(initial: T) -> Self {
        Self::build(initial, StreamSink::with_fold(|_, last: &T| last.clone()))
    }

    /// A cell that combines several values sent in one transaction with `fold`.
    pub fn with_fold(initial: T, fold: impl Fn(&T, &T) -> T + Send + Sync + 'static) -> Self {
        Self::build(initial, StreamSink::with_fold(fold))
    }

    /// A cell whose derived streams, cells and listeners are counted in `refs`.
    pub fn tracked(initial: T, refs: MemReferences) -> Self {
        Self::build(
            initial,
            StreamSink::tracked_with_fold(refs, |_, last: &T| last.clone()),
        )
    }

    fn build(initial: T, sink: StreamSink<T>) -> Self {
        let cell = Transaction::apply(|trans| Cell::build(trans, sink.stream(), CellValue::Ready(initial)));
        Self { cell, sink }
    }

    /// Set the cell's value. It becomes visible when the transaction closes.
    ///
    /// # Panics
    ///
    /// Raises [`crate::FrpError::SendInCallback`] when called from a
    /// propagation callback.
    pub fn send(&self, value: T) {
        self.sink.send(value);
    }

    /// Set the cell's value, reporting misuse as an error.
    pub fn try_send(&self, value: T) -> Result<()> {
        self.sink.try_send(value)
    }

    /// A read-only handle to the cell.
    pub fn cell(&self) -> Cell<T> {
        self.cell.clone()
    }
}

impl<T> Deref for CellSink<T> {
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T> Clone for CellSink<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            sink: self.sink.clone(),
        }
    }
}

impl<T> fmt::Debug for CellSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellSink").field("cell", &self.cell).finish()
    }
}
