//! Deferred values.
//!
//! A [`Lazy`] stands for a value that may not exist yet, typically because
//! the transaction that produces it has not closed. Reading it runs the
//! underlying thunk every time, so thunks should be cheap and referentially
//! transparent.

use std::fmt;
use std::sync::Arc;

/// A value that may only become available later.
pub struct Lazy<T> {
    thunk: Arc<dyn Fn() -> T + Send + Sync>,
}

impl<T: 'static> Lazy<T> {
    /// Wrap a thunk.
    pub fn new(thunk: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            thunk: Arc::new(thunk),
        }
    }

    /// A lazy value that is already known.
    pub fn of(value: T) -> Self
    where
        T: Clone + Send + Sync,
    {
        Self::new(move || value.clone())
    }

    /// Read the value.
    pub fn get(&self) -> T {
        (self.thunk)()
    }

    /// Apply `f` to the value when it is read.
    pub fn map<U: 'static>(&self, f: impl Fn(T) -> U + Send + Sync + 'static) -> Lazy<U> {
        let this = self.clone();
        Lazy::new(move || f(this.get()))
    }

    /// Combine with another lazy value.
    pub fn lift2<B: 'static, C: 'static>(
        &self,
        b: &Lazy<B>,
        f: impl Fn(T, B) -> C + Send + Sync + 'static,
    ) -> Lazy<C> {
        let (a, b) = (self.clone(), b.clone());
        Lazy::new(move || f(a.get(), b.get()))
    }

    /// Combine with two other lazy values.
    pub fn lift3<B: 'static, C: 'static, D: 'static>(
        &self,
        b: &Lazy<B>,
        c: &Lazy<C>,
        f: impl Fn(T, B, C) -> D + Send + Sync + 'static,
    ) -> Lazy<D> {
        let (a, b, c) = (self.clone(), b.clone(), c.clone());
        Lazy::new(move || f(a.get(), b.get(), c.get()))
    }

    /// Combine with three other lazy values.
    pub fn lift4<B: 'static, C: 'static, D: 'static, E: 'static>(
        &self,
        b: &Lazy<B>,
        c: &Lazy<C>,
        d: &Lazy<D>,
        f: impl Fn(T, B, C, D) -> E + Send + Sync + 'static,
    ) -> Lazy<E> {
        let (a, b, c, d) = (self.clone(), b.clone(), c.clone(), d.clone());
        Lazy::new(move || f(a.get(), b.get(), c.get(), d.get()))
    }
}

impl<T> Clone for Lazy<T> {
    fn clone(&self) -> Self {
        Self {
            thunk: Arc::clone(&self.thunk),
        }
    }
}

impl<T> fmt::Debug for Lazy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Lazy(..)")
    }
}
