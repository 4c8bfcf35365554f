//! Collapsing several sends in one transaction into a single firing.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{Stream, WeakStream};
use crate::error::{FrpError, Result};
use crate::graph::RankRef;
use crate::transaction::Transaction;
use crate::Value;

/// Combines an earlier value with a later one from the same transaction.
pub(crate) type Fold<T> = Arc<dyn Fn(&T, &T) -> T + Send + Sync>;

/// Accumulates the values sent to a stream in one transaction and fires the
/// result once, at the stream's rank.
///
/// Without a fold function a second value in the same transaction is an
/// error.
pub(crate) struct CoalesceHandler<T> {
    fold: Option<Fold<T>>,
    accum: Arc<Mutex<Option<T>>>,
    out: WeakStream<T>,
    rank: RankRef,
}

impl<T: Value> CoalesceHandler<T> {
    pub(crate) fn new(fold: Option<Fold<T>>, out: &Stream<T>) -> Self {
        Self {
            fold,
            accum: Arc::new(Mutex::new(None)),
            out: out.downgrade(),
            rank: out.rank(),
        }
    }

    pub(crate) fn send(&self, trans: &Transaction, value: T) -> Result<()> {
        let mut accum = self.accum.lock();
        match accum.take() {
            Some(previous) => match &self.fold {
                Some(fold) => {
                    *accum = Some(fold(&previous, &value));
                    Ok(())
                }
                None => {
                    *accum = Some(previous);
                    Err(FrpError::UncoalescedSend)
                }
            },
            None => {
                *accum = Some(value);
                drop(accum);

                let pending = Arc::clone(&self.accum);
                let out = self.out.clone();
                trans.schedule(Arc::clone(&self.rank), move |trans| {
                    let value = pending.lock().take();
                    if let (Some(value), Some(out)) = (value, out.upgrade()) {
                        out.send(trans, value);
                    }
                });
                // an aborted transaction never flushes, but its last queue runs
                let leftover = Arc::clone(&self.accum);
                trans.run_last(move || {
                    let value = leftover.lock().take();
                    drop(value);
                });
                Ok(())
            }
        }
    }
}

impl<T: Value> Stream<T> {
    /// A stream that fires at most once per transaction, folding together
    /// everything this stream fires in that transaction.
    pub(crate) fn coalesce(&self, trans: &Transaction, fold: Fold<T>) -> Stream<T> {
        let out = Stream::with_refs(self.refs());
        let handler = CoalesceHandler::new(Some(fold), &out);
        let listener = self.listen_with(
            out.rank(),
            trans,
            Arc::new(move |trans: &Transaction, value: &T| {
                // a handler with a fold never rejects a value
                let _ = handler.send(trans, value.clone());
            }),
            false,
        );
        out.own(listener);
        out
    }

    /// Keep only the last value fired in each transaction.
    pub(crate) fn last_firing_only(&self, trans: &Transaction) -> Stream<T> {
        self.coalesce(trans, Arc::new(|_: &T, last: &T| last.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collected(stream: &Stream<i32>) -> (Arc<Mutex<Vec<i32>>>, crate::Listener) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&out);
        let listener = stream.listen(move |v| sink.lock().push(*v));
        (out, listener)
    }

    #[test]
    fn folds_values_of_one_transaction() {
        let input = Stream::<i32>::never();
        let folded = Transaction::apply(|trans| input.coalesce(trans, Arc::new(|a: &i32, b: &i32| a + b)));
        let (out, _l) = collected(&folded);

        Transaction::apply(|trans| {
            input.send(trans, 1);
            input.send(trans, 2);
            input.send(trans, 3);
        });
        Transaction::apply(|trans| input.send(trans, 10));

        assert_eq!(*out.lock(), vec![6, 10]);
    }

    #[test]
    fn last_firing_only_keeps_last() {
        let input = Stream::<i32>::never();
        let last = Transaction::apply(|trans| input.last_firing_only(trans));
        let (out, _l) = collected(&last);

        Transaction::apply(|trans| {
            input.send(trans, 1);
            input.send(trans, 2);
        });

        assert_eq!(*out.lock(), vec![2]);
    }

    #[test]
    fn handler_without_fold_rejects_second_value() {
        let out = Stream::<i32>::never();
        let handler = CoalesceHandler::new(None, &out);

        Transaction::apply(|trans| {
            assert_eq!(handler.send(trans, 1), Ok(()));
            assert_eq!(handler.send(trans, 2), Err(FrpError::UncoalescedSend));
        });
        Transaction::apply(|trans| assert_eq!(handler.send(trans, 3), Ok(())));
    }

    #[test]
    fn handler_forgets_value_of_aborted_transaction() {
        let out = Stream::<i32>::never();
        let handler = CoalesceHandler::new(None, &out);

        let failed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Transaction::apply(|trans| {
                assert_eq!(handler.send(trans, 1), Ok(()));
                panic!("opener failed");
            })
        }));
        assert!(failed.is_err());
        assert!(handler.accum.lock().is_none());

        Transaction::apply(|trans| assert_eq!(handler.send(trans, 2), Ok(())));
    }
}
