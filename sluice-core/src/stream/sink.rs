//! Writable streams: the way values enter the graph from outside.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::{CoalesceHandler, Fold, Stream};
use crate::error::{violation, FrpError, Result};
use crate::memory::MemReferences;
use crate::transaction::{CallbackGuard, Transaction};
use crate::Value;

/// A stream that external code can push values into.
///
/// Derefs to [`Stream`], so every combinator is available on the sink. Hand
/// out [`StreamSink::stream`] to code that should only observe.
///
/// ```rust,ignore
/// let clicks = StreamSink::new();
/// let count = clicks.accum(0, |_, n| n + 1);
///
/// clicks.send(());
/// clicks.send(());
/// assert_eq!(count.sample(), 2);
/// ```
pub struct StreamSink<T> {
    stream: Stream<T>,
    coalescer: Arc<CoalesceHandler<T>>,
}

impl<T: Value> StreamSink<T> {
    /// A sink that accepts one value per transaction.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// A sink that combines several values sent in one transaction with `fold`.
    pub fn with_fold(fold: impl Fn(&T, &T) -> T + Send + Sync + 'static) -> Self {
        Self::build(Some(Arc::new(fold)), None)
    }

    /// A sink whose derived streams, cells and listeners are counted in `refs`.
    pub fn tracked(refs: MemReferences) -> Self {
        Self::build(None, Some(refs))
    }

    /// A counted sink that folds values with `fold`.
    pub fn tracked_with_fold(
        refs: MemReferences,
        fold: impl Fn(&T, &T) -> T + Send + Sync + 'static,
    ) -> Self {
        Self::build(Some(Arc::new(fold)), Some(refs))
    }

    fn build(fold: Option<Fold<T>>, refs: Option<MemReferences>) -> Self {
        let stream = Stream::with_refs(refs);
        let coalescer = Arc::new(CoalesceHandler::new(fold, &stream));
        Self { stream, coalescer }
    }

    /// Send a value, in a new transaction unless one is already open.
    ///
    /// # Panics
    ///
    /// Raises [`FrpError::SendInCallback`] when called from a propagation
    /// callback, and [`FrpError::UncoalescedSend`] on a second send in one
    /// transaction to a sink without a fold function.
    pub fn send(&self, value: T) {
        if let Err(err) = self.try_send(value) {
            violation(err);
        }
    }

    /// Send a value, reporting misuse as an error instead of panicking.
    pub fn try_send(&self, value: T) -> Result<()> {
        if CallbackGuard::is_active() {
            return Err(FrpError::SendInCallback);
        }
        Transaction::apply(|trans| self.coalescer.send(trans, value))
    }

    /// A read-only handle to the sink's stream.
    pub fn stream(&self) -> Stream<T> {
        self.stream.clone()
    }
}

impl<T: Value> Default for StreamSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deref for StreamSink<T> {
    type Target = Stream<T>;

    fn deref(&self) -> &Stream<T> {
        &self.stream
    }
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            coalescer: Arc::clone(&self.coalescer),
        }
    }
}

impl<T> fmt::Debug for StreamSink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::panic;

    #[test]
    fn fold_combines_sends_in_one_transaction() {
        let sink = StreamSink::with_fold(|a: &i32, b: &i32| a.max(b).to_owned());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let _l = sink.listen(move |v| record.lock().push(*v));

        Transaction::run(|| {
            sink.send(3);
            sink.send(7);
            sink.send(5);
        });

        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn second_send_without_fold_is_rejected() {
        let sink = StreamSink::new();
        let result = Transaction::run(|| {
            sink.try_send(1)?;
            sink.try_send(2)
        });
        assert_eq!(result, Err(FrpError::UncoalescedSend));
    }

    #[test]
    fn send_inside_callback_is_refused() {
        let sink = StreamSink::<i32>::new();
        let other = StreamSink::<i32>::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&results);
        let target = other.clone();
        let _l = sink.listen(move |v| record.lock().push(target.try_send(*v)));

        sink.send(1);

        assert_eq!(*results.lock(), vec![Err(FrpError::SendInCallback)]);
    }

    #[test]
    fn send_raises_violation_payload() {
        let sink = StreamSink::new();
        let payload = panic::catch_unwind(panic::AssertUnwindSafe(|| {
            Transaction::run(|| {
                sink.send(1);
                sink.send(2);
            })
        }))
        .unwrap_err();

        assert_eq!(
            payload.downcast_ref::<FrpError>(),
            Some(&FrpError::UncoalescedSend)
        );
    }
}
