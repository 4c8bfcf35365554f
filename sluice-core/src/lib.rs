//! Sluice Core
//!
//! A transactional, glitch-free functional reactive programming engine.
//! It implements:
//!
//! - Streams of discrete events and cells of time-varying values
//! - Transactions that propagate every change in rank order
//! - Forward references (loops) for cyclic definitions
//! - Deferred work that runs after a transaction commits
//!
//! Within one transaction every stream fires at most once, every cell
//! shows one consistent value, and a cell's new value is only visible once
//! the transaction has committed.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `transaction`: the scheduler and the process-wide transaction lock
//! - `graph`: rank-ordered dependency nodes and the priority queue
//! - `stream`: event streams, sinks, loops and combinators
//! - `cell`: held values, sinks, loops and lifting
//! - `listener`: subscription handles
//! - `operational`: primitives that expose individual cell steps
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parking_lot::Mutex;
//! use sluice_core::{CellSink, StreamSink};
//!
//! let clicks = StreamSink::<i32>::new();
//! let total = clicks.accum(0, |n, sum| sum + n);
//! let label = total.map(|sum| format!("total: {sum}"));
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let record = Arc::clone(&seen);
//! let _listener = label.listen(move |text| record.lock().push(text.clone()));
//!
//! clicks.send(2);
//! clicks.send(3);
//! assert_eq!(*seen.lock(), ["total: 0", "total: 2", "total: 5"]);
//!
//! let scale = CellSink::new(10);
//! let scaled = total.lift2(&scale, |sum, k| sum * k);
//! assert_eq!(scaled.sample(), 50);
//! ```

pub mod cell;
pub mod config;
pub mod error;
pub mod graph;
pub mod lazy;
pub mod listener;
pub mod memory;
pub mod operational;
pub mod stream;
pub mod transaction;

pub use cell::{Cell, CellFn, CellLoop, CellSink, WeakCell};
pub use config::{failure_policy, override_failure_policy, set_failure_policy, FailurePolicy};
pub use error::{FrpError, Result};
pub use lazy::Lazy;
pub use listener::{CompositeListener, Listener, WeakListener};
pub use memory::MemReferences;
pub use stream::{Stream, StreamLoop, StreamSink, WeakStream};
pub use transaction::{Transaction, TransactionGuard, POST_DETACHED};

/// Values that can flow through streams and cells.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Value for T {}
