//! Stream combinators.
//!
//! Each combinator builds a new stream fed by its inputs. The functions passed
//! in run during propagation; they may sample cells but must otherwise be
//! pure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use super::{StreamLoop, Stream};
use crate::cell::{Cell, CellValue, WeakCell};
use crate::graph::Node;
use crate::lazy::Lazy;
use crate::listener::{Listener, WeakListener};
use crate::transaction::{self, Transaction};
use crate::Value;

impl<T: Value> Stream<T> {
    /// Transform each value with `f`.
    pub fn map<U: Value>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> Stream<U> {
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<U>| out.send(trans, f(value)))
        })
    }

    /// Replace each value with `value`.
    pub fn map_to<U: Value>(&self, value: U) -> Stream<U> {
        self.map(move |_| value.clone())
    }

    /// Keep only the values for which `predicate` holds.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Stream<T> {
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<T>| {
                if predicate(value) {
                    out.send(trans, value.clone());
                }
            })
        })
    }

    /// Transform each value with `f`, dropping the ones mapped to `None`.
    pub fn filter_map<U: Value>(
        &self,
        f: impl Fn(&T) -> Option<U> + Send + Sync + 'static,
    ) -> Stream<U> {
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<U>| {
                if let Some(mapped) = f(value) {
                    out.send(trans, mapped);
                }
            })
        })
    }

    /// Fire the values of both streams. When both fire in one transaction the
    /// two values are combined with `f`, this stream's value on the left, so
    /// the result fires at most once per transaction.
    pub fn merge(
        &self,
        other: &Stream<T>,
        f: impl Fn(&T, &T) -> T + Send + Sync + 'static,
    ) -> Stream<T> {
        Transaction::apply(|trans| self.merge_raw(trans, other).coalesce(trans, Arc::new(f)))
    }

    /// Merge, keeping this stream's value when both fire together.
    pub fn or_else(&self, other: &Stream<T>) -> Stream<T> {
        self.merge(other, |left, _| left.clone())
    }

    /// Both inputs feed one stream; this stream's values are delivered first
    /// because they pass through an extra node ranked below the output.
    fn merge_raw(&self, trans: &Transaction, other: &Stream<T>) -> Stream<T> {
        let out = Stream::with_refs(self.refs());
        let left: Node<()> = Node::new();
        let (_, edge) = left.link(Arc::new(|_: &Transaction, _: &()| {}), out.rank());

        let from_left = self.forward_to(trans, left.as_rank(), &out);
        let from_right = other.forward_to(trans, out.rank(), &out);
        out.own(from_left);
        out.own(from_right);
        out.own(Listener::tracked(
            move || {
                let _lock = transaction::lock();
                left.unlink(edge);
            },
            self.refs(),
        ));
        out
    }

    /// Fire the value `cell` holds whenever this stream fires.
    pub fn snapshot1<B: Value>(&self, cell: &Cell<B>) -> Stream<B> {
        self.snapshot(cell, |_, b| b.clone())
    }

    /// Combine each value with the value `cell` holds at that moment.
    ///
    /// The cell is read as it was at the start of the transaction.
    pub fn snapshot<B: Value, C: Value>(
        &self,
        cell: &Cell<B>,
        f: impl Fn(&T, &B) -> C + Send + Sync + 'static,
    ) -> Stream<C> {
        let cell = cell.clone();
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<C>| {
                out.send(trans, f(value, &cell.sample_no_transaction()));
            })
        })
    }

    /// Combine each value with the values of two cells.
    pub fn snapshot2<B: Value, C: Value, D: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        f: impl Fn(&T, &B, &C) -> D + Send + Sync + 'static,
    ) -> Stream<D> {
        let (cb, cc) = (cb.clone(), cc.clone());
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<D>| {
                let (b, c) = (cb.sample_no_transaction(), cc.sample_no_transaction());
                out.send(trans, f(value, &b, &c));
            })
        })
    }

    /// Combine each value with the values of three cells.
    pub fn snapshot3<B: Value, C: Value, D: Value, E: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        cd: &Cell<D>,
        f: impl Fn(&T, &B, &C, &D) -> E + Send + Sync + 'static,
    ) -> Stream<E> {
        let (cb, cc, cd) = (cb.clone(), cc.clone(), cd.clone());
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<E>| {
                let b = cb.sample_no_transaction();
                let c = cc.sample_no_transaction();
                let d = cd.sample_no_transaction();
                out.send(trans, f(value, &b, &c, &d));
            })
        })
    }

    /// Combine each value with the values of four cells.
    pub fn snapshot4<B: Value, C: Value, D: Value, E: Value, F: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        cd: &Cell<D>,
        ce: &Cell<E>,
        f: impl Fn(&T, &B, &C, &D, &E) -> F + Send + Sync + 'static,
    ) -> Stream<F> {
        let (cb, cc, cd, ce) = (cb.clone(), cc.clone(), cd.clone(), ce.clone());
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<F>| {
                let b = cb.sample_no_transaction();
                let c = cc.sample_no_transaction();
                let d = cd.sample_no_transaction();
                let e = ce.sample_no_transaction();
                out.send(trans, f(value, &b, &c, &d, &e));
            })
        })
    }

    /// Sample a cell through a weak handle, so the output does not keep the
    /// cell alive. Used where the cell is itself built from the output.
    fn snapshot_weak<B: Value, C: Value>(
        &self,
        trans: &Transaction,
        cell: WeakCell<B>,
        f: impl Fn(&T, &B) -> C + Send + Sync + 'static,
    ) -> Stream<C> {
        self.derive(trans, move |trans, value, out: &Stream<C>| {
            if let Some(cell) = cell.upgrade() {
                out.send(trans, f(value, &cell.sample_no_transaction()));
            }
        })
    }

    /// Let values through only while `cell` holds `true`.
    pub fn gate(&self, cell: &Cell<bool>) -> Stream<T> {
        let cell = cell.clone();
        Transaction::apply(|trans| {
            self.derive(trans, move |trans, value, out: &Stream<T>| {
                if cell.sample_no_transaction() {
                    out.send(trans, value.clone());
                }
            })
        })
    }

    /// A cell that starts as `initial` and takes each value this stream fires.
    ///
    /// Updates become visible once the transaction that fired them closes.
    pub fn hold(&self, initial: T) -> Cell<T> {
        Transaction::apply(|trans| Cell::build(trans, self.clone(), CellValue::Ready(initial)))
    }

    /// Like [`Stream::hold`], with an initial value computed on first sample.
    pub fn hold_lazy(&self, initial: Lazy<T>) -> Cell<T> {
        Transaction::apply(|trans| Cell::build(trans, self.clone(), CellValue::Pending(initial)))
    }

    /// Run a state machine over this stream: `f` maps each value and the
    /// current state to an output and the next state.
    pub fn collect<B: Value, S: Value>(
        &self,
        initial: S,
        f: impl Fn(&T, &S) -> (B, S) + Send + Sync + 'static,
    ) -> Stream<B> {
        self.collect_lazy(Lazy::of(initial), f)
    }

    /// Like [`Stream::collect`], with a lazily computed initial state.
    pub fn collect_lazy<B: Value, S: Value>(
        &self,
        initial: Lazy<S>,
        f: impl Fn(&T, &S) -> (B, S) + Send + Sync + 'static,
    ) -> Stream<B> {
        Transaction::apply(|trans| {
            let state_loop = StreamLoop::<S>::with_refs(self.refs());
            let state = state_loop.hold_lazy(initial);
            let steps = self.snapshot_weak(trans, state.downgrade(), f);
            let outputs = steps.map(|(b, _)| b.clone());
            let next = steps.map(|(_, s)| s.clone());
            state_loop.loop_(&next);
            outputs.anchor(state);
            outputs
        })
    }

    /// A cell accumulating this stream's values into a state with `f`.
    pub fn accum<S: Value>(
        &self,
        initial: S,
        f: impl Fn(&T, &S) -> S + Send + Sync + 'static,
    ) -> Cell<S> {
        self.accum_lazy(Lazy::of(initial), f)
    }

    /// Like [`Stream::accum`], with a lazily computed initial state.
    pub fn accum_lazy<S: Value>(
        &self,
        initial: Lazy<S>,
        f: impl Fn(&T, &S) -> S + Send + Sync + 'static,
    ) -> Cell<S> {
        Transaction::apply(|trans| {
            let state_loop = StreamLoop::<S>::with_refs(self.refs());
            let state = state_loop.hold_lazy(initial);
            let next = self.snapshot_weak(trans, state.downgrade(), f);
            state_loop.loop_(&next);
            state
        })
    }

    /// Fire only the first value, then disconnect from the input.
    pub fn once(&self) -> Stream<T> {
        Transaction::apply(|trans| {
            let fired = AtomicBool::new(false);
            let slot: Arc<OnceLock<WeakListener>> = Arc::new(OnceLock::new());
            let own = Arc::clone(&slot);

            let out = Stream::with_refs(self.refs());
            let weak = out.downgrade();
            let listener = self.listen_with(
                out.rank(),
                trans,
                Arc::new(move |trans: &Transaction, value: &T| {
                    if fired.swap(true, Ordering::SeqCst) {
                        return;
                    }
                    if let Some(out) = weak.upgrade() {
                        out.send(trans, value.clone());
                    }
                    if let Some(listener) = own.get() {
                        listener.unlisten();
                    }
                }),
                false,
            );
            let _ = slot.set(listener.downgrade());
            out.own(listener);
            out
        })
    }
}

impl<T: Value + PartialEq> Stream<T> {
    /// Drop values equal to the previous one.
    pub fn calm(&self) -> Stream<T> {
        self.calm_lazy(Lazy::of(None))
    }

    /// Drop values equal to the previous one, treating `last` as the value
    /// before the first.
    pub fn calm_from(&self, last: T) -> Stream<T> {
        self.calm_lazy(Lazy::of(Some(last)))
    }

    pub(crate) fn calm_lazy(&self, last: Lazy<Option<T>>) -> Stream<T> {
        self.collect_lazy(last, |value: &T, last: &Option<T>| {
            if last.as_ref() == Some(value) {
                (None, last.clone())
            } else {
                (Some(value.clone()), Some(value.clone()))
            }
        })
        .filter_map(Option::clone)
    }
}
