//! Listener Handles
//!
//! A [`Listener`] represents one registration of a callback (or of an internal
//! edge) in the graph. Unlistening removes the registration and releases
//! whatever the registration was keeping alive.
//!
//! # Lifetime
//!
//! Unlistening happens at most once: either explicitly through
//! [`Listener::unlisten`] or implicitly when the last handle is dropped. Keep
//! the handle around for as long as the callback should fire.
//!
//! ```rust,ignore
//! let sink = StreamSink::new();
//! let listener = sink.listen(|x: &i32| println!("{x}"));
//!
//! sink.send(1);          // prints 1
//! listener.unlisten();
//! sink.send(2);          // prints nothing
//! ```

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::memory::{MemReferences, Tracked};

type Unlisten = Box<dyn FnOnce() + Send>;

struct ListenerInner {
    unlisten: Mutex<Option<Unlisten>>,
    _tracked: Tracked,
}

impl ListenerInner {
    fn run(&self) {
        let unlisten = self.unlisten.lock().take();
        if let Some(unlisten) = unlisten {
            unlisten();
        }
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(unlisten) = self.unlisten.get_mut().take() {
            unlisten();
        }
    }
}

/// Handle to a registration in the graph.
///
/// Cloning yields another handle to the same registration.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// A listener that runs `unlisten` when it is disposed.
    pub fn new(unlisten: impl FnOnce() + Send + 'static) -> Self {
        Self::tracked(unlisten, None)
    }

    /// A listener that does nothing when disposed.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub(crate) fn tracked(unlisten: impl FnOnce() + Send + 'static, refs: Option<MemReferences>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                unlisten: Mutex::new(Some(Box::new(unlisten))),
                _tracked: Tracked::new(refs),
            }),
        }
    }

    /// Remove the registration. Later calls do nothing.
    pub fn unlisten(&self) {
        self.inner.run();
    }

    /// Whether the registration is still in place.
    pub fn is_listening(&self) -> bool {
        self.inner.unlisten.lock().is_some()
    }

    /// A handle that does not keep the registration alive.
    pub fn downgrade(&self) -> WeakListener {
        WeakListener {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Non-owning counterpart of [`Listener`].
#[derive(Clone)]
pub struct WeakListener {
    inner: Weak<ListenerInner>,
}

impl WeakListener {
    /// Recover a strong handle if the registration is still owned somewhere.
    pub fn upgrade(&self) -> Option<Listener> {
        self.inner.upgrade().map(|inner| Listener { inner })
    }

    /// Unlisten if the registration is still alive.
    pub fn unlisten(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.run();
        }
    }
}

impl fmt::Debug for WeakListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakListener")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

/// A group of listeners disposed together.
#[derive(Default)]
pub struct CompositeListener {
    listeners: Mutex<SmallVec<[Listener; 4]>>,
}

impl CompositeListener {
    /// An empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one listener to the group.
    pub fn add(&self, listener: Listener) {
        self.listeners.lock().push(listener);
    }

    /// Add several listeners to the group.
    pub fn add_all(&self, listeners: impl IntoIterator<Item = Listener>) {
        self.listeners.lock().extend(listeners);
    }

    /// Number of listeners in the group.
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Unlisten every member, in the order they were added.
    pub fn unlisten(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in &listeners {
            listener.unlisten();
        }
    }
}

impl From<CompositeListener> for Listener {
    fn from(group: CompositeListener) -> Self {
        Listener::new(move || group.unlisten())
    }
}

impl fmt::Debug for CompositeListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeListener")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (Arc<AtomicUsize>, Listener) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = Listener::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[test]
    fn unlisten_is_idempotent() {
        let (count, listener) = counting();
        assert!(listener.is_listening());

        listener.unlisten();
        listener.unlisten();
        drop(listener);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_last_handle_unlistens() {
        let (count, listener) = counting();
        let second = listener.clone();

        drop(listener);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn weak_handle_does_not_keep_alive() {
        let (count, listener) = counting();
        let weak = listener.downgrade();
        assert!(weak.upgrade().is_some());

        drop(listener);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(weak.upgrade().is_none());
        weak.unlisten();
    }

    #[test]
    fn composite_unlistens_members() {
        let (a, first) = counting();
        let (b, second) = counting();

        let group = CompositeListener::new();
        group.add(first);
        group.add_all([second]);
        assert_eq!(group.len(), 2);

        let listener: Listener = group.into();
        listener.unlisten();
        listener.unlisten();

        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tracked_listener_counts() {
        let refs = MemReferences::new();
        let listener = Listener::tracked(|| {}, Some(refs.clone()));
        assert_eq!(refs.count(), 1);
        drop(listener);
        assert_eq!(refs.count(), 0);
    }
}
