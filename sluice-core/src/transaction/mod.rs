//! Transactions
//!
//! A transaction is one atomic step of the propagation timeline. Everything
//! that happens as a consequence of a set of external sends is scheduled into
//! the same transaction and runs before it closes.
//!
//! # Overview
//!
//! A transaction owns three work-lists:
//!
//! - **Prioritized entries**: node deliveries, run in rank order and FIFO among
//!   equal ranks. This is where values travel through the graph.
//! - **Last queue**: runs once the prioritized entries are exhausted. Cells
//!   commit their new values here and streams forget their firings.
//! - **Post queue**: indexed work that runs after the transaction has closed.
//!   Index [`POST_DETACHED`] runs outside any transaction; every other index
//!   gets a fresh transaction of its own, opened and closed in index order.
//!
//! # Design Decisions
//!
//! 1. A single process-wide reentrant lock serializes transactions. The
//!    thread that holds it may reacquire it, which is how nested
//!    [`Transaction::apply`] calls join the transaction already open.
//!
//! 2. The transaction itself is thread-bound (`Rc`), and is found through a
//!    thread-local slot. Only the lock holder ever has one open.
//!
//! 3. Each action runs behind `catch_unwind`, so a failing callback cannot
//!    leave the scheduler half-drained. What happens to the panic afterwards
//!    is decided by [`FailurePolicy`]. Protocol violations
//!    ([`FrpError`] payloads) are always re-raised.

mod context;

pub(crate) use context::CallbackGuard;
pub(crate) use context::CurrentSwap;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use tracing::{debug, trace, warn};

use crate::config::{failure_policy, FailurePolicy};
use crate::error::FrpError;
use crate::graph::{EntryKey, PriorityQueue, RankRef};

/// Post index that runs after the transaction closes, with no transaction open.
pub const POST_DETACHED: i64 = -1;

type Payload = Box<dyn Any + Send>;
type Action = Box<dyn FnOnce(&Transaction)>;
type LastAction = Box<dyn FnOnce()>;
type PostAction = Box<dyn FnOnce(Option<&Transaction>)>;
type StartHook = Arc<dyn Fn() + Send + Sync>;

fn transaction_lock() -> &'static ReentrantMutex<()> {
    static LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| ReentrantMutex::new(()))
}

/// Hold the transaction lock without opening a transaction.
///
/// Graph edits made outside propagation (unlinking a dropped listener, for
/// instance) take this so they never interleave with a running transaction.
pub(crate) fn lock() -> ReentrantMutexGuard<'static, ()> {
    transaction_lock().lock()
}

fn start_hooks() -> &'static Mutex<Vec<StartHook>> {
    static HOOKS: OnceLock<Mutex<Vec<StartHook>>> = OnceLock::new();
    HOOKS.get_or_init(|| Mutex::new(Vec::new()))
}

thread_local! {
    static RUNNING_START_HOOKS: Cell<bool> = const { Cell::new(false) };
}

fn run_start_hooks() {
    if RUNNING_START_HOOKS.with(|running| running.replace(true)) {
        return;
    }

    struct Reset;
    impl Drop for Reset {
        fn drop(&mut self) {
            RUNNING_START_HOOKS.with(|running| running.set(false));
        }
    }
    let _reset = Reset;

    let hooks: Vec<StartHook> = start_hooks().lock().clone();
    for hook in hooks {
        hook();
    }
}

struct Entry {
    node: RankRef,
    action: Action,
}

#[derive(Default)]
struct State {
    entries: HashMap<u64, Entry>,
    queue: PriorityQueue,
    to_regen: bool,
    last_queue: VecDeque<LastAction>,
    post_queue: BTreeMap<i64, PostAction>,
}

impl State {
    /// Rebuild the queue from the entries using their nodes' current ranks.
    fn regenerate(&mut self) {
        self.to_regen = false;
        self.queue.clear();
        for (&seq, entry) in &self.entries {
            self.queue.push(EntryKey {
                rank: entry.node.rank(),
                seq,
            });
        }
        trace!(entries = self.queue.len(), "priority queue regenerated");
    }

    fn pop_entry(&mut self) -> Option<Entry> {
        if self.to_regen {
            self.regenerate();
        }
        loop {
            let key = self.queue.pop()?;
            if let Some(entry) = self.entries.remove(&key.seq) {
                return Some(entry);
            }
        }
    }
}

/// Handle to an open transaction.
///
/// Handles are cheap to clone and only usable on the thread that opened the
/// transaction.
#[derive(Clone)]
pub struct Transaction {
    state: Rc<RefCell<State>>,
}

impl Transaction {
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::default())),
        }
    }

    /// The transaction open on this thread, if any.
    pub fn current() -> Option<Transaction> {
        context::current()
    }

    /// Whether a transaction is open on this thread.
    pub fn has_current() -> bool {
        context::current().is_some()
    }

    /// Take the transaction lock and join the open transaction, or open a new
    /// one if there is none.
    ///
    /// The transaction closes when the guard is closed or dropped, if this
    /// guard was the one that opened it.
    pub fn acquire() -> TransactionGuard {
        let lock = transaction_lock().lock();
        if let Some(trans) = context::current() {
            return TransactionGuard {
                trans,
                outermost: None,
                finished: false,
                _lock: lock,
            };
        }

        run_start_hooks();
        let trans = Transaction::new();
        debug!("transaction opened");
        let swap = CurrentSwap::install(Some(trans.clone()));
        TransactionGuard {
            trans,
            outermost: Some(swap),
            finished: false,
            _lock: lock,
        }
    }

    /// Run `f` inside a transaction and return its result.
    ///
    /// Joins the open transaction if there is one. Otherwise the new
    /// transaction is closed, with all its consequences propagated, before
    /// `apply` returns.
    pub fn apply<R>(f: impl FnOnce(&Transaction) -> R) -> R {
        let guard = Self::acquire();
        let result = f(guard.transaction());
        guard.close();
        result
    }

    /// Like [`Transaction::apply`] for closures that do not need the handle.
    pub fn run<R>(f: impl FnOnce() -> R) -> R {
        Self::apply(|_| f())
    }

    /// Register a hook that runs whenever an outermost transaction opens.
    ///
    /// Transactions opened by a hook do not trigger the hooks again.
    pub fn on_start(hook: impl Fn() + Send + Sync + 'static) {
        let _lock = transaction_lock().lock();
        start_hooks().lock().push(Arc::new(hook));
    }

    /// Run `action` once the current (or a new) transaction has closed, with
    /// no transaction open.
    pub fn post_detached(action: impl FnOnce() + 'static) {
        Self::apply(|trans| trans.post(POST_DETACHED, move |_| action()));
    }

    /// Schedule `action` to run when `node`'s turn comes.
    pub fn schedule(&self, node: RankRef, action: impl FnOnce(&Transaction) + 'static) {
        let key = EntryKey::next(node.rank());
        let mut state = self.state.borrow_mut();
        state.queue.push(key);
        state.entries.insert(
            key.seq,
            Entry {
                node,
                action: Box::new(action),
            },
        );
    }

    /// Mark the queue stale after a rank changed.
    pub fn set_needs_regenerating(&self) {
        self.state.borrow_mut().to_regen = true;
    }

    /// Run `action` after every prioritized entry has run.
    pub fn run_last(&self, action: impl FnOnce() + 'static) {
        self.state
            .borrow_mut()
            .last_queue
            .push_back(Box::new(action));
    }

    /// Run `action` after this transaction closes.
    ///
    /// Actions posted to the same index run one after the other, in post order.
    pub fn post(&self, index: i64, action: impl FnOnce(Option<&Transaction>) + 'static) {
        let mut state = self.state.borrow_mut();
        let combined: PostAction = match state.post_queue.remove(&index) {
            Some(existing) => Box::new(move |trans: Option<&Transaction>| {
                existing(trans);
                action(trans);
            }),
            None => Box::new(action),
        };
        state.post_queue.insert(index, combined);
    }

    /// Drain all three phases. Returns the panic to re-raise, if any.
    fn close(&self) -> Option<Payload> {
        let mut failure = None;
        let mut executed = 0usize;

        loop {
            let entry = self.state.borrow_mut().pop_entry();
            let Some(Entry { action, .. }) = entry else {
                break;
            };
            executed += 1;
            capture(&mut failure, || action(self));
        }

        loop {
            let action = self.state.borrow_mut().last_queue.pop_front();
            let Some(action) = action else {
                break;
            };
            capture(&mut failure, action);
        }

        debug!(executed, "transaction closed");

        loop {
            let posts = std::mem::take(&mut self.state.borrow_mut().post_queue);
            if posts.is_empty() {
                break;
            }
            for (index, action) in posts {
                if index < 0 {
                    let _detached = CurrentSwap::install(None);
                    capture(&mut failure, || action(None));
                } else {
                    let child = Transaction::new();
                    debug!(index, "post transaction opened");
                    let _swap = CurrentSwap::install(Some(child.clone()));
                    capture(&mut failure, || action(Some(&child)));
                    if let Some(payload) = child.close() {
                        keep(&mut failure, payload);
                    }
                }
            }
        }

        failure
    }

    /// Throw away queued work after the opener panicked, still running the
    /// last queue so cells and streams are left consistent.
    fn abort(&self) {
        let last_queue = {
            let mut state = self.state.borrow_mut();
            state.entries.clear();
            state.queue.clear();
            state.post_queue.clear();
            std::mem::take(&mut state.last_queue)
        };
        warn!(
            last_actions = last_queue.len(),
            "transaction aborted by panic"
        );
        for action in last_queue {
            let _ = panic::catch_unwind(AssertUnwindSafe(action));
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Transaction")
            .field("entries", &state.entries.len())
            .field("to_regen", &state.to_regen)
            .field("last_queue", &state.last_queue.len())
            .field("post_queue", &state.post_queue.len())
            .finish()
    }
}

/// Run one action, recording its panic according to the failure policy.
fn capture(failure: &mut Option<Payload>, action: impl FnOnce()) {
    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(action)) else {
        return;
    };

    if let Some(err) = payload.downcast_ref::<FrpError>() {
        debug!(error = %err, "protocol violation raised in callback");
    } else {
        match failure_policy() {
            FailurePolicy::Swallow => {
                warn!(
                    message = panic_message(payload.as_ref()),
                    "callback panicked; failure swallowed"
                );
                return;
            }
            FailurePolicy::Propagate => {
                debug!(
                    message = panic_message(payload.as_ref()),
                    "callback panicked; re-raised at close"
                );
            }
        }
    }
    keep(failure, payload);
}

/// Keep the first failure, except that a protocol violation displaces an
/// ordinary panic.
fn keep(failure: &mut Option<Payload>, payload: Payload) {
    let replace = match failure {
        None => true,
        Some(existing) => !existing.is::<FrpError>() && payload.is::<FrpError>(),
    };
    if replace {
        *failure = Some(payload);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Holds the transaction lock and, for the outermost guard, the open
/// transaction.
pub struct TransactionGuard {
    trans: Transaction,
    outermost: Option<CurrentSwap>,
    finished: bool,
    _lock: ReentrantMutexGuard<'static, ()>,
}

impl TransactionGuard {
    /// The transaction this guard belongs to.
    pub fn transaction(&self) -> &Transaction {
        &self.trans
    }

    /// Whether this guard opened the transaction (and will close it).
    pub fn is_outermost(&self) -> bool {
        self.outermost.is_some()
    }

    /// Close the transaction if this guard opened it.
    ///
    /// Re-raises the first callback panic kept under
    /// [`FailurePolicy::Propagate`], after the transaction state and the lock
    /// have been released.
    pub fn close(mut self) {
        self.finished = true;
        if let Some(payload) = self.finish() {
            drop(self);
            panic::resume_unwind(payload);
        }
    }

    fn finish(&mut self) -> Option<Payload> {
        let swap = self.outermost.take()?;
        let failure = self.trans.close();
        drop(swap);
        failure
    }
}

impl Drop for TransactionGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if std::thread::panicking() {
            if let Some(swap) = self.outermost.take() {
                self.trans.abort();
                drop(swap);
            }
            return;
        }

        if let Some(payload) = self.finish() {
            panic::resume_unwind(payload);
        }
    }
}

impl fmt::Debug for TransactionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionGuard")
            .field("transaction", &self.trans)
            .field("outermost", &self.is_outermost())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::override_failure_policy;
    use crate::graph::{null_node, Node};

    fn log() -> Rc<RefCell<Vec<&'static str>>> {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn push(log: &Rc<RefCell<Vec<&'static str>>>, item: &'static str) -> impl FnOnce(&Transaction) {
        let log = Rc::clone(log);
        move |_| log.borrow_mut().push(item)
    }

    #[test]
    fn entries_run_in_rank_order() {
        let order = log();
        let low: Node<()> = Node::with_rank(1);
        let high: Node<()> = Node::with_rank(5);

        Transaction::apply(|trans| {
            trans.schedule(high.as_rank(), push(&order, "high"));
            trans.schedule(low.as_rank(), push(&order, "low"));
            trans.schedule(null_node(), push(&order, "null"));
        });

        assert_eq!(*order.borrow(), vec!["null", "low", "high"]);
    }

    #[test]
    fn equal_ranks_run_fifo() {
        let order = log();
        Transaction::apply(|trans| {
            trans.schedule(null_node(), push(&order, "a"));
            trans.schedule(null_node(), push(&order, "b"));
            trans.schedule(null_node(), push(&order, "c"));
        });
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn regeneration_follows_bumped_ranks() {
        let order = log();
        let first: Node<()> = Node::with_rank(1);
        let second: Node<()> = Node::with_rank(2);

        Transaction::apply(|trans| {
            trans.schedule(first.as_rank(), push(&order, "first"));
            trans.schedule(second.as_rank(), push(&order, "second"));

            // second now feeds first, so first must run after it
            let (changed, _) = second.link(Arc::new(|_: &Transaction, _: &()| {}), first.as_rank());
            assert!(changed);
            trans.set_needs_regenerating();
        });

        assert_eq!(*order.borrow(), vec!["second", "first"]);
    }

    #[test]
    fn work_scheduled_during_drain_runs_in_same_transaction() {
        let order = log();
        let inner = Rc::clone(&order);
        Transaction::apply(|trans| {
            trans.schedule(null_node(), move |trans| {
                inner.borrow_mut().push("outer");
                let nested = Rc::clone(&inner);
                trans.schedule(null_node(), move |_| nested.borrow_mut().push("nested"));
            });
        });
        assert_eq!(*order.borrow(), vec!["outer", "nested"]);
    }

    #[test]
    fn last_queue_runs_after_entries() {
        let order = log();
        let last = Rc::clone(&order);
        Transaction::apply(|trans| {
            trans.run_last(move || last.borrow_mut().push("last"));
            trans.schedule(null_node(), push(&order, "entry"));
        });
        assert_eq!(*order.borrow(), vec!["entry", "last"]);
    }

    #[test]
    fn posts_run_in_index_order_in_fresh_transactions() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let opened = Rc::new(RefCell::new(None::<Transaction>));

        Transaction::apply(|trans| {
            *opened.borrow_mut() = Some(trans.clone());
            for index in [2, 0, 1] {
                let order = Rc::clone(&order);
                let opened = Rc::clone(&opened);
                trans.post(index, move |child| {
                    let child = child.expect("indexed posts get a transaction");
                    let outer = opened.borrow();
                    assert!(!Rc::ptr_eq(&child.state, &outer.as_ref().unwrap().state));
                    assert!(Transaction::has_current());
                    order.borrow_mut().push(index);
                });
            }
        });

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert!(!Transaction::has_current());
    }

    #[test]
    fn posts_to_same_index_compose_in_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        Transaction::apply(|trans| {
            for item in ["existing", "new"] {
                let order = Rc::clone(&order);
                trans.post(0, move |_| order.borrow_mut().push(item));
            }
        });
        assert_eq!(*order.borrow(), vec!["existing", "new"]);
    }

    #[test]
    fn detached_post_runs_outside_any_transaction() {
        let seen = Rc::new(Cell::new(None));
        let inner = Rc::clone(&seen);
        Transaction::run(|| {
            Transaction::post_detached(move || inner.set(Some(Transaction::has_current())));
            assert!(seen.get().is_none());
        });
        assert_eq!(seen.get(), Some(false));
    }

    #[test]
    fn apply_is_reentrant() {
        Transaction::apply(|outer| {
            Transaction::apply(|inner| {
                assert!(Rc::ptr_eq(&outer.state, &inner.state));
            });
            let guard = Transaction::acquire();
            assert!(!guard.is_outermost());
        });
        assert!(!Transaction::has_current());
    }

    #[test]
    fn propagate_policy_reraises_after_close() {
        let _policy = override_failure_policy(FailurePolicy::Propagate);
        let ran_last = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran_last);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            Transaction::apply(|trans| {
                trans.schedule(null_node(), |_| panic!("callback failed"));
                trans.run_last(move || flag.set(true));
            });
        }));

        let payload = result.unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "callback failed");
        assert!(ran_last.get());
        assert!(!Transaction::has_current());
    }

    #[test]
    fn swallow_policy_keeps_going() {
        let _policy = override_failure_policy(FailurePolicy::Swallow);
        let order = log();

        Transaction::apply(|trans| {
            trans.schedule(null_node(), |_| panic!("ignored"));
            trans.schedule(null_node(), push(&order, "after"));
        });

        assert_eq!(*order.borrow(), vec!["after"]);
    }

    #[test]
    fn violations_propagate_under_swallow() {
        let _policy = override_failure_policy(FailurePolicy::Swallow);
        let result = panic::catch_unwind(|| {
            Transaction::apply(|trans| {
                trans.schedule(null_node(), |_| panic!("ordinary"));
                trans.schedule(null_node(), |_| {
                    crate::error::violation(FrpError::LoopedTwice);
                });
            });
        });
        let payload = result.unwrap_err();
        assert_eq!(
            payload.downcast_ref::<FrpError>(),
            Some(&FrpError::LoopedTwice)
        );
    }

    #[test]
    fn panic_in_opener_discards_queued_work() {
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            Transaction::apply(|trans| {
                trans.schedule(null_node(), move |_| flag.set(true));
                panic!("opener failed");
            })
        }));
        assert!(result.is_err());
        assert!(!ran.get());
        assert!(!Transaction::has_current());
    }

    #[test]
    fn start_hooks_fire_for_outermost_transactions_only() {
        thread_local! {
            static STARTS: Cell<usize> = const { Cell::new(0) };
        }
        Transaction::on_start(|| STARTS.with(|s| s.set(s.get() + 1)));

        let before = STARTS.with(Cell::get);
        Transaction::run(|| Transaction::run(|| {}));
        assert_eq!(STARTS.with(Cell::get), before + 1);
    }
}
