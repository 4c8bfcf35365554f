//! Operational primitives.
//!
//! These expose details that the rest of the API hides on purpose: the
//! individual steps of a cell, and the point at which a transaction ends.
//! Code built on them should not let its callers observe those details.

use crate::cell::Cell;
use crate::stream::Stream;
use crate::transaction::Transaction;
use crate::Value;

/// The stream of a cell's updates.
pub fn updates<T: Value>(cell: &Cell<T>) -> Stream<T> {
    cell.updates()
}

/// A stream that fires a cell's current value once, then each update.
pub fn value<T: Value>(cell: &Cell<T>) -> Stream<T> {
    Transaction::apply(|trans| cell.value(trans))
}

/// Fire each value again in a new transaction that starts after the current
/// one closes.
pub fn defer<T: Value>(stream: &Stream<T>) -> Stream<T> {
    split(&stream.map(|value| vec![value.clone()]))
}

/// Fire each item of every collection in a transaction of its own, in order.
///
/// Items at the same position in collections fired by different splits land
/// in the same transaction.
pub fn split<C, T>(stream: &Stream<C>) -> Stream<T>
where
    C: Value + IntoIterator<Item = T>,
    T: Value,
{
    Transaction::apply(|trans| {
        stream.derive(trans, |trans, items: &C, out: &Stream<T>| {
            for (index, item) in items.clone().into_iter().enumerate() {
                let out = out.clone();
                trans.post(index as i64, move |child: Option<&Transaction>| {
                    if let Some(child) = child {
                        out.send(child, item);
                    }
                });
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellSink, StreamSink};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn updates_skip_current_value() {
        let cell = CellSink::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let _l = updates(&cell).listen(move |v| record.lock().push(*v));

        cell.send(2);

        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn value_starts_with_current_value() {
        let cell = CellSink::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let _l = Transaction::run(|| value(&cell).listen(move |v| record.lock().push(*v)));

        cell.send(2);

        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn split_fires_items_in_separate_transactions() {
        let sink = StreamSink::<Vec<i32>>::new();
        let items = split(&sink);
        let total = items.accum(0, |x, sum| sum + x);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let _l = total.updates().listen(move |v| record.lock().push(*v));

        sink.send(vec![1, 2, 3]);

        // one update per item, so no item was folded into another
        assert_eq!(*seen.lock(), vec![1, 3, 6]);
    }

    #[test]
    fn defer_runs_after_current_transaction() {
        let sink = StreamSink::<i32>::new();
        let held = sink.hold(0);
        let deferred = defer(&sink).snapshot(&held, |_, seen| *seen);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let _l = deferred.listen(move |v| record.lock().push(*v));

        sink.send(5);

        // the deferred firing already sees the committed value
        assert_eq!(*seen.lock(), vec![5]);
    }
}
