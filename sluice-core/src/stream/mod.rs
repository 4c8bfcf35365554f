//! Streams
//!
//! A [`Stream`] is a source of discrete events. Each event belongs to exactly
//! one transaction, and a stream fires at most once per transaction unless
//! something upstream sends to it several times.
//!
//! # Overview
//!
//! Every stream owns a node in the rank graph. Sending a value schedules each
//! of the node's edges at the rank of the node it feeds, so downstream streams
//! always fire after their inputs.
//!
//! A stream also remembers what it sent in the current transaction. A listener
//! attached later in the same transaction is replayed those values, so the
//! order of `send` and `listen` within a transaction does not matter.
//!
//! # Ownership
//!
//! Edges point downstream but hold their target weakly. A derived stream owns
//! the listener that connects it to its input, and that listener owns the
//! input stream. Dropping the last handle to a derived stream therefore
//! disconnects it and releases everything it alone was keeping alive.

mod coalesce;
mod combinators;
mod looping;
mod sink;

pub(crate) use coalesce::{CoalesceHandler, Fold};
pub use looping::StreamLoop;
pub use sink::StreamSink;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::graph::{null_node, Node, RankRef, TargetAction, TargetId};
use crate::listener::{Listener, WeakListener};
use crate::memory::{MemReferences, Tracked};
use crate::transaction::{self, CallbackGuard, Transaction};
use crate::Value;

pub(crate) struct StreamInner<T> {
    node: Node<T>,
    firings: Mutex<Vec<T>>,
    cleanups: Mutex<Vec<Listener>>,
    anchors: Mutex<Vec<Box<dyn Any + Send + Sync>>>,
    tracked: Tracked,
}

/// A stream of discrete events.
///
/// Cloning yields another handle to the same stream.
pub struct Stream<T> {
    inner: Arc<StreamInner<T>>,
}

/// Non-owning handle to a [`Stream`].
pub struct WeakStream<T> {
    inner: Weak<StreamInner<T>>,
}

impl<T: Value> Stream<T> {
    /// A stream that never fires.
    pub fn never() -> Self {
        Self::with_refs(None)
    }

    pub(crate) fn with_refs(refs: Option<MemReferences>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                node: Node::new(),
                firings: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
                anchors: Mutex::new(Vec::new()),
                tracked: Tracked::new(refs),
            }),
        }
    }

    pub(crate) fn refs(&self) -> Option<MemReferences> {
        self.inner.tracked.refs()
    }

    pub(crate) fn rank(&self) -> RankRef {
        self.inner.node.as_rank()
    }

    /// A handle that does not keep the stream alive.
    pub fn downgrade(&self) -> WeakStream<T> {
        WeakStream {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether two handles refer to the same stream.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of edges currently fed by this stream.
    pub fn listener_count(&self) -> usize {
        self.inner.node.target_count()
    }

    /// Fire `value` in `trans`.
    pub(crate) fn send(&self, trans: &Transaction, value: T) {
        let first = {
            let mut firings = self.inner.firings.lock();
            let first = firings.is_empty();
            firings.push(value.clone());
            first
        };
        if first {
            let weak = Arc::downgrade(&self.inner);
            trans.run_last(move || {
                if let Some(inner) = weak.upgrade() {
                    let cleared = std::mem::take(&mut *inner.firings.lock());
                    drop(cleared);
                }
            });
        }

        for target in self.inner.node.targets() {
            let value = value.clone();
            let node = Arc::clone(target.node());
            trans.schedule(node, move |trans| {
                let _callback = CallbackGuard::enter();
                (target.action())(trans, &value);
            });
        }
    }

    /// Link `action` into this stream's node, feeding `target`.
    ///
    /// Values already sent in `trans` are replayed to the new edge unless
    /// `suppress_earlier` is set. The returned listener owns this stream and
    /// removes the edge when disposed.
    pub(crate) fn listen_with(
        &self,
        target: RankRef,
        trans: &Transaction,
        action: TargetAction<T>,
        suppress_earlier: bool,
    ) -> Listener {
        // edge firings already queued must not reach a disposed listener
        let alive = Arc::new(AtomicBool::new(true));
        let action: TargetAction<T> = {
            let alive = Arc::clone(&alive);
            Arc::new(move |trans: &Transaction, value: &T| {
                if alive.load(Ordering::SeqCst) {
                    action(trans, value);
                }
            })
        };
        let (changed, id) = self.inner.node.link(Arc::clone(&action), Arc::clone(&target));
        if changed {
            trans.set_needs_regenerating();
        }

        if !suppress_earlier {
            let firings = self.inner.firings.lock().clone();
            if !firings.is_empty() {
                trans.schedule(target, move |trans| {
                    for value in &firings {
                        let _callback = CallbackGuard::enter();
                        action(trans, value);
                    }
                });
            }
        }

        self.unlink_on_dispose(id, alive)
    }

    /// A listener that owns this stream and unlinks edge `id` when disposed.
    fn unlink_on_dispose(&self, id: TargetId, alive: Arc<AtomicBool>) -> Listener {
        let stream = self.clone();
        Listener::tracked(
            move || {
                let _lock = transaction::lock();
                alive.store(false, Ordering::SeqCst);
                stream.inner.node.unlink(id);
            },
            self.refs(),
        )
    }

    /// Build a stream fed by this one through `action`.
    pub(crate) fn derive<U: Value>(
        &self,
        trans: &Transaction,
        action: impl Fn(&Transaction, &T, &Stream<U>) + Send + Sync + 'static,
    ) -> Stream<U> {
        let out = Stream::with_refs(self.refs());
        let weak = out.downgrade();
        let listener = self.listen_with(
            out.rank(),
            trans,
            Arc::new(move |trans: &Transaction, value: &T| {
                if let Some(out) = weak.upgrade() {
                    action(trans, value, &out);
                }
            }),
            false,
        );
        out.own(listener);
        out
    }

    /// Forward every value of this stream into `out`.
    pub(crate) fn forward_to(&self, trans: &Transaction, target: RankRef, out: &Stream<T>) -> Listener {
        let weak = out.downgrade();
        self.listen_with(
            target,
            trans,
            Arc::new(move |trans: &Transaction, value: &T| {
                if let Some(out) = weak.upgrade() {
                    out.send(trans, value.clone());
                }
            }),
            false,
        )
    }

    /// Dispose `listener` together with this stream.
    pub(crate) fn own(&self, listener: Listener) {
        self.inner.cleanups.lock().push(listener);
    }

    /// Keep `value` alive as long as this stream is.
    pub(crate) fn anchor(&self, value: impl Any + Send + Sync) {
        self.inner.anchors.lock().push(Box::new(value));
    }

    /// Call `handler` for every value this stream fires.
    ///
    /// The handler runs inside propagation: it must not block and must not
    /// send to a sink. Dropping (or unlistening) the returned [`Listener`]
    /// stops delivery.
    pub fn listen(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Listener {
        Transaction::apply(|trans| {
            self.listen_with(
                null_node(),
                trans,
                Arc::new(move |_: &Transaction, value: &T| handler(value)),
                false,
            )
        })
    }

    /// Call `handler` for the next value only, then unlisten.
    pub fn listen_once(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> Listener {
        let slot: Arc<OnceLock<WeakListener>> = Arc::new(OnceLock::new());
        let fired = AtomicBool::new(false);
        let own = Arc::clone(&slot);
        let listener = self.listen(move |value| {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            handler(value);
            if let Some(listener) = own.get() {
                listener.unlisten();
            }
        });
        let _ = slot.set(listener.downgrade());
        listener
    }

    /// A stream equivalent to this one that also disposes `listener` when it
    /// is dropped.
    pub fn add_cleanup(&self, listener: Listener) -> Stream<T> {
        Transaction::apply(|trans| {
            let out = Stream::with_refs(self.refs());
            let forward = self.forward_to(trans, out.rank(), &out);
            out.own(forward);
            out.own(listener);
            out
        })
    }
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("node", &self.inner.node)
            .field("cleanups", &self.inner.cleanups.lock().len())
            .finish()
    }
}

impl<T> WeakStream<T> {
    /// Recover a strong handle if the stream is still alive.
    pub fn upgrade(&self) -> Option<Stream<T>> {
        self.inner.upgrade().map(|inner| Stream { inner })
    }
}

impl<T> Clone for WeakStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for WeakStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakStream")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder<T: Value>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        (out, move |value: &T| sink.lock().push(value.clone()))
    }

    #[test]
    fn never_fires() {
        let (out, record) = recorder::<i32>();
        let _l = Stream::<i32>::never().listen(record);
        assert!(out.lock().is_empty());
    }

    #[test]
    fn sends_reach_listeners() {
        let stream = Stream::<i32>::never();
        let (out, record) = recorder::<i32>();
        let _l = stream.listen(record);

        Transaction::apply(|trans| stream.send(trans, 5));
        Transaction::apply(|trans| stream.send(trans, 6));

        assert_eq!(*out.lock(), vec![5, 6]);
    }

    #[test]
    fn listener_disposed_mid_send_is_not_called() {
        let stream = Stream::<i32>::never();
        let victim: Arc<Mutex<Option<Listener>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&victim);
        let _first = stream.listen(move |_| {
            if let Some(listener) = slot.lock().take() {
                listener.unlisten();
            }
        });
        let (out, record) = recorder::<i32>();
        *victim.lock() = Some(stream.listen(record));

        Transaction::apply(|trans| stream.send(trans, 1));
        Transaction::apply(|trans| stream.send(trans, 2));

        assert!(out.lock().is_empty());
        assert!(victim.lock().is_none());
    }

    #[test]
    fn two_sends_in_one_transaction_both_deliver() {
        let stream = Stream::<i32>::never();
        let (out, record) = recorder::<i32>();
        let _l = stream.listen(record);

        Transaction::apply(|trans| {
            stream.send(trans, 1);
            stream.send(trans, 2);
        });

        assert_eq!(*out.lock(), vec![1, 2]);
    }

    #[test]
    fn late_listener_sees_earlier_firings() {
        let stream = Stream::<i32>::never();
        let (out, record) = recorder::<i32>();

        let listener = Transaction::apply(|trans| {
            stream.send(trans, 9);
            stream.listen(record)
        });
        assert_eq!(*out.lock(), vec![9]);

        // firings are forgotten once the transaction closes
        let (later, record) = recorder::<i32>();
        let _late = stream.listen(record);
        assert!(later.lock().is_empty());
        drop(listener);
    }

    #[test]
    fn dropping_listener_unlinks() {
        let stream = Stream::<i32>::never();
        let (out, record) = recorder::<i32>();
        let listener = stream.listen(record);
        assert_eq!(stream.listener_count(), 1);

        drop(listener);
        assert_eq!(stream.listener_count(), 0);

        Transaction::apply(|trans| stream.send(trans, 1));
        assert!(out.lock().is_empty());
    }

    #[test]
    fn listen_once_fires_once() {
        let stream = Stream::<i32>::never();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let _l = stream.listen_once(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        Transaction::apply(|trans| stream.send(trans, 1));
        Transaction::apply(|trans| stream.send(trans, 2));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(stream.listener_count(), 0);
    }

    #[test]
    fn add_cleanup_disposes_with_stream() {
        let stream = Stream::<i32>::never();
        let disposed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&disposed);

        let cleaned = stream.add_cleanup(Listener::new(move || flag.store(true, Ordering::SeqCst)));
        let (out, record) = recorder::<i32>();
        let listener = cleaned.listen(record);

        Transaction::apply(|trans| stream.send(trans, 3));
        assert_eq!(*out.lock(), vec![3]);

        drop(cleaned);
        assert!(!disposed.load(Ordering::SeqCst));
        drop(listener);
        assert!(disposed.load(Ordering::SeqCst));
    }

    #[test]
    fn derived_stream_dies_with_its_last_handle() {
        let stream = Stream::<i32>::never();
        let derived = Transaction::apply(|trans| {
            stream.derive(trans, |trans, value: &i32, out: &Stream<i32>| out.send(trans, *value))
        });
        let weak = derived.downgrade();
        assert_eq!(stream.listener_count(), 1);

        drop(derived);
        assert!(weak.upgrade().is_none());
        assert_eq!(stream.listener_count(), 0);
    }
}
