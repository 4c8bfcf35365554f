//! Applying functions held in cells.
//!
//! [`Cell::apply`] is the primitive: it combines a cell of functions with a
//! cell of arguments. The `lift` family builds on it by currying, so a cell
//! derived from several inputs still updates at most once per transaction no
//! matter how many of the inputs changed.

use std::sync::Arc;

use parking_lot::Mutex;

use super::Cell;
use crate::graph::Node;
use crate::lazy::Lazy;
use crate::listener::Listener;
use crate::stream::Stream;
use crate::transaction::{self, Transaction};
use crate::Value;

/// A function held in a cell.
pub type CellFn<A, B> = Arc<dyn Fn(&A) -> B + Send + Sync>;

struct ApplyState<A, B> {
    f: Option<CellFn<A, B>>,
    a: Option<A>,
}

impl<A: Value> Cell<A> {
    /// A cell holding the function in `bf` applied to the value in `ba`.
    pub fn apply<B: Value>(bf: &Cell<CellFn<A, B>>, ba: &Cell<A>) -> Cell<B> {
        Transaction::apply(|trans| {
            let out: Stream<B> = Stream::with_refs(ba.refs());
            let in_target: Node<()> = Node::new();
            let (_, edge) = in_target.link(Arc::new(|_: &Transaction, _: &()| {}), out.rank());

            let state = Arc::new(Mutex::new(ApplyState::<A, B> { f: None, a: None }));

            // recompute at the output's rank, after both inputs have settled
            let fire: Arc<dyn Fn(&Transaction) + Send + Sync> = {
                let state = Arc::clone(&state);
                let weak = out.downgrade();
                let rank = out.rank();
                Arc::new(move |trans: &Transaction| {
                    let state = Arc::clone(&state);
                    let weak = weak.clone();
                    trans.schedule(Arc::clone(&rank), move |trans| {
                        let inputs = {
                            let state = state.lock();
                            match (&state.f, &state.a) {
                                (Some(f), Some(a)) => Some((Arc::clone(f), a.clone())),
                                _ => None,
                            }
                        };
                        if let (Some((f, a)), Some(out)) = (inputs, weak.upgrade()) {
                            out.send(trans, f(&a));
                        }
                    });
                })
            };

            let on_function = {
                let state = Arc::clone(&state);
                let fire = Arc::clone(&fire);
                Arc::new(move |trans: &Transaction, f: &CellFn<A, B>| {
                    let ready = {
                        let mut state = state.lock();
                        state.f = Some(Arc::clone(f));
                        state.a.is_some()
                    };
                    if ready {
                        fire(trans);
                    }
                })
            };
            let on_argument = {
                let state = Arc::clone(&state);
                Arc::new(move |trans: &Transaction, a: &A| {
                    let ready = {
                        let mut state = state.lock();
                        state.a = Some(a.clone());
                        state.f.is_some()
                    };
                    if ready {
                        fire(trans);
                    }
                })
            };

            let l1 = bf.value(trans).listen_with(in_target.as_rank(), trans, on_function, false);
            let l2 = ba.value(trans).listen_with(in_target.as_rank(), trans, on_argument, false);

            let settled = out.last_firing_only(trans);
            settled.own(l1);
            settled.own(l2);
            settled.own(Listener::tracked(
                move || {
                    let _lock = transaction::lock();
                    in_target.unlink(edge);
                },
                ba.refs(),
            ));

            let (bf, ba) = (bf.clone(), ba.clone());
            settled.hold_lazy(Lazy::new(move || {
                let f = bf.sample_no_transaction();
                f(&ba.sample_no_transaction())
            }))
        })
    }

    /// Combine this cell with another through `f`.
    pub fn lift2<B: Value, C: Value>(
        &self,
        cb: &Cell<B>,
        f: impl Fn(&A, &B) -> C + Send + Sync + 'static,
    ) -> Cell<C> {
        let f = Arc::new(f);
        let partial = self.map(move |a: &A| {
            let (f, a) = (Arc::clone(&f), a.clone());
            Arc::new(move |b: &B| f(&a, b)) as CellFn<B, C>
        });
        Cell::apply(&partial, cb)
    }

    /// Combine this cell with two others through `f`.
    pub fn lift3<B: Value, C: Value, D: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        f: impl Fn(&A, &B, &C) -> D + Send + Sync + 'static,
    ) -> Cell<D> {
        let f = Arc::new(f);
        let partial = self.lift2(cb, move |a: &A, b: &B| {
            let (f, a, b) = (Arc::clone(&f), a.clone(), b.clone());
            Arc::new(move |c: &C| f(&a, &b, c)) as CellFn<C, D>
        });
        Cell::apply(&partial, cc)
    }

    /// Combine this cell with three others through `f`.
    pub fn lift4<B: Value, C: Value, D: Value, E: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        cd: &Cell<D>,
        f: impl Fn(&A, &B, &C, &D) -> E + Send + Sync + 'static,
    ) -> Cell<E> {
        let f = Arc::new(f);
        let partial = self.lift3(cb, cc, move |a: &A, b: &B, c: &C| {
            let (f, a, b, c) = (Arc::clone(&f), a.clone(), b.clone(), c.clone());
            Arc::new(move |d: &D| f(&a, &b, &c, d)) as CellFn<D, E>
        });
        Cell::apply(&partial, cd)
    }

    /// Combine this cell with four others through `f`.
    pub fn lift5<B: Value, C: Value, D: Value, E: Value, F: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        cd: &Cell<D>,
        ce: &Cell<E>,
        f: impl Fn(&A, &B, &C, &D, &E) -> F + Send + Sync + 'static,
    ) -> Cell<F> {
        let f = Arc::new(f);
        let partial = self.lift4(cb, cc, cd, move |a: &A, b: &B, c: &C, d: &D| {
            let (f, a, b, c, d) = (Arc::clone(&f), a.clone(), b.clone(), c.clone(), d.clone());
            Arc::new(move |e: &E| f(&a, &b, &c, &d, e)) as CellFn<E, F>
        });
        Cell::apply(&partial, ce)
    }

    /// Combine this cell with five others through `f`.
    #[allow(clippy::too_many_arguments)]
    pub fn lift6<B: Value, C: Value, D: Value, E: Value, F: Value, G: Value>(
        &self,
        cb: &Cell<B>,
        cc: &Cell<C>,
        cd: &Cell<D>,
        ce: &Cell<E>,
        cf: &Cell<F>,
        f: impl Fn(&A, &B, &C, &D, &E, &F) -> G + Send + Sync + 'static,
    ) -> Cell<G> {
        let f = Arc::new(f);
        let partial = self.lift5(cb, cc, cd, ce, move |a: &A, b: &B, c: &C, d: &D, e: &E| {
            let (f, a, b, c, d, e) =
                (Arc::clone(&f), a.clone(), b.clone(), c.clone(), d.clone(), e.clone());
            Arc::new(move |x: &F| f(&a, &b, &c, &d, &e, x)) as CellFn<F, G>
        });
        Cell::apply(&partial, cf)
    }
}
