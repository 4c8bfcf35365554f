//! Forward references to cells.

use std::fmt;
use std::ops::Deref;

use super::{Cell, CellValue};
use crate::error::{violation, FrpError, Result};
use crate::lazy::Lazy;
use crate::stream::StreamLoop;
use crate::transaction::Transaction;
use crate::Value;

/// A cell that is defined later with [`CellLoop::loop_`].
///
/// Must be created and resolved inside the same explicit transaction, and
/// must not be sampled before it is resolved.
pub struct CellLoop<T> {
    cell: Cell<T>,
    stream: StreamLoop<T>,
}

impl<T: Value> CellLoop<T> {
    /// Create a loop.
    ///
    /// # Panics
    ///
    /// Raises [`FrpError::LoopOutsideTransaction`] when no transaction is open.
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(cell_loop) => cell_loop,
            Err(err) => violation(err),
        }
    }

    /// Create a loop, or report that no transaction is open.
    pub fn try_new() -> Result<Self> {
        let stream = StreamLoop::try_new()?;
        let unresolved = Lazy::new(|| -> T { violation(FrpError::LoopSampledBeforeResolved) });
        let cell = Transaction::apply(|trans| {
            Cell::build(trans, stream.stream(), CellValue::Pending(unresolved))
        });
        Ok(Self { cell, stream })
    }

    /// Make this loop follow `cell`.
    ///
    /// # Panics
    ///
    /// Raises [`FrpError::LoopedTwice`] if the loop was already resolved.
    pub fn loop_(&self, cell: &Cell<T>) {
        if let Err(err) = self.try_loop(cell) {
            violation(err);
        }
    }

    /// Resolve the loop, or report that it was already resolved.
    pub fn try_loop(&self, cell: &Cell<T>) -> Result<()> {
        Transaction::apply(|trans| {
            self.stream.try_loop(&cell.updates())?;
            self.cell.reseed(cell.sample_lazy(trans));
            Ok(())
        })
    }

    /// Whether [`CellLoop::loop_`] has been called.
    pub fn is_looped(&self) -> bool {
        self.stream.is_looped()
    }

    /// A handle to the looped cell.
    pub fn cell(&self) -> Cell<T> {
        self.cell.clone()
    }
}

impl<T> Deref for CellLoop<T> {
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T> Clone for CellLoop<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            stream: self.stream.clone(),
        }
    }
}

impl<T> fmt::Debug for CellLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellLoop")
            .field("stream", &self.stream)
            .finish()
    }
}
