//! Forward references to streams, for graphs with feedback.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Stream;
use crate::error::{violation, FrpError, Result};
use crate::memory::MemReferences;
use crate::transaction::Transaction;
use crate::Value;

/// A stream that is defined later with [`StreamLoop::loop_`].
///
/// Must be created and resolved inside the same explicit transaction.
///
/// ```rust,ignore
/// let total = Transaction::run(|| {
///     let feedback = StreamLoop::new();
///     let total = feedback.hold(0);
///     let next = input.snapshot(&total, |delta, sum| sum + delta);
///     feedback.loop_(&next);
///     total
/// });
/// ```
pub struct StreamLoop<T> {
    stream: Stream<T>,
    assigned: Arc<AtomicBool>,
}

impl<T: Value> StreamLoop<T> {
    /// Create a loop.
    ///
    /// # Panics
    ///
    /// Raises [`FrpError::LoopOutsideTransaction`] when no transaction is open.
    pub fn new() -> Self {
        match Self::try_new() {
            Ok(stream_loop) => stream_loop,
            Err(err) => violation(err),
        }
    }

    /// Create a loop, or report that no transaction is open.
    pub fn try_new() -> Result<Self> {
        if !Transaction::has_current() {
            return Err(FrpError::LoopOutsideTransaction);
        }
        Ok(Self::with_refs(None))
    }

    pub(crate) fn with_refs(refs: Option<MemReferences>) -> Self {
        Self {
            stream: Stream::with_refs(refs),
            assigned: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make this loop fire whatever `stream` fires.
    ///
    /// # Panics
    ///
    /// Raises [`FrpError::LoopedTwice`] if the loop was already resolved.
    pub fn loop_(&self, stream: &Stream<T>) {
        if let Err(err) = self.try_loop(stream) {
            violation(err);
        }
    }

    /// Resolve the loop, or report that it was already resolved.
    pub fn try_loop(&self, stream: &Stream<T>) -> Result<()> {
        if self.assigned.swap(true, Ordering::SeqCst) {
            return Err(FrpError::LoopedTwice);
        }
        Transaction::apply(|trans| {
            let forward = stream.forward_to(trans, self.stream.rank(), &self.stream);
            self.stream.own(forward);
        });
        Ok(())
    }

    /// Whether [`StreamLoop::loop_`] has been called.
    pub fn is_looped(&self) -> bool {
        self.assigned.load(Ordering::SeqCst)
    }

    /// The looped stream.
    pub fn stream(&self) -> Stream<T> {
        self.stream.clone()
    }
}

impl<T> Deref for StreamLoop<T> {
    type Target = Stream<T>;

    fn deref(&self) -> &Stream<T> {
        &self.stream
    }
}

impl<T> Clone for StreamLoop<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
            assigned: Arc::clone(&self.assigned),
        }
    }
}

impl<T> fmt::Debug for StreamLoop<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLoop")
            .field("looped", &self.assigned.load(Ordering::SeqCst))
            .field("stream", &self.stream)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamSink;
    use parking_lot::Mutex;

    #[test]
    fn loop_requires_a_transaction() {
        assert_eq!(
            StreamLoop::<i32>::try_new().unwrap_err(),
            FrpError::LoopOutsideTransaction
        );
    }

    #[test]
    fn looped_stream_forwards_values() {
        let sink = StreamSink::<i32>::new();
        let looped = Transaction::run(|| {
            let l = StreamLoop::new();
            l.loop_(&sink);
            l.stream()
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let _l = looped.listen(move |v| record.lock().push(*v));
        sink.send(4);

        assert_eq!(*seen.lock(), vec![4]);
    }

    #[test]
    fn looping_twice_fails() {
        let sink = StreamSink::<i32>::new();
        Transaction::run(|| {
            let l = StreamLoop::new();
            assert!(!l.is_looped());
            assert_eq!(l.try_loop(&sink), Ok(()));
            assert_eq!(l.try_loop(&sink), Err(FrpError::LoopedTwice));
        });
    }
}
