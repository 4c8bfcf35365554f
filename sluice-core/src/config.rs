//! Engine Configuration
//!
//! The engine has one tunable: what happens when a propagation callback
//! panics. The callback is always isolated (the scheduler finishes draining
//! and restores its state), but the panic can either be re-raised to the
//! caller that opened the transaction or logged and dropped.
//!
//! The process-wide default can be changed with [`set_failure_policy`]. A
//! thread can temporarily override it with [`override_failure_policy`]; since
//! transactions run on the thread that opened them, the override covers every
//! transaction that thread opens while the guard is alive.

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, Ordering};

/// What to do with a panic raised by a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Re-raise the first panic once the transaction has fully closed.
    #[default]
    Propagate,

    /// Log the panic and carry on.
    Swallow,
}

impl FailurePolicy {
    fn to_raw(self) -> u8 {
        match self {
            FailurePolicy::Propagate => 0,
            FailurePolicy::Swallow => 1,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => FailurePolicy::Swallow,
            _ => FailurePolicy::Propagate,
        }
    }
}

static DEFAULT_POLICY: AtomicU8 = AtomicU8::new(0);

thread_local! {
    static POLICY_OVERRIDE: Cell<Option<FailurePolicy>> = const { Cell::new(None) };
}

/// Set the process-wide failure policy.
pub fn set_failure_policy(policy: FailurePolicy) {
    DEFAULT_POLICY.store(policy.to_raw(), Ordering::Relaxed);
}

/// The failure policy in effect on the calling thread.
pub fn failure_policy() -> FailurePolicy {
    POLICY_OVERRIDE
        .with(Cell::get)
        .unwrap_or_else(|| FailurePolicy::from_raw(DEFAULT_POLICY.load(Ordering::Relaxed)))
}

/// Override the failure policy on this thread until the guard is dropped.
pub fn override_failure_policy(policy: FailurePolicy) -> PolicyGuard {
    let previous = POLICY_OVERRIDE.with(|slot| slot.replace(Some(policy)));
    PolicyGuard { previous }
}

/// Restores the previous thread-local policy when dropped.
#[must_use = "the override ends when the guard is dropped"]
pub struct PolicyGuard {
    previous: Option<FailurePolicy>,
}

impl Drop for PolicyGuard {
    fn drop(&mut self) {
        POLICY_OVERRIDE.with(|slot| slot.set(self.previous));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_propagates() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::Propagate);
    }

    #[test]
    fn override_is_scoped() {
        let before = failure_policy();
        {
            let _guard = override_failure_policy(FailurePolicy::Swallow);
            assert_eq!(failure_policy(), FailurePolicy::Swallow);

            {
                let _inner = override_failure_policy(FailurePolicy::Propagate);
                assert_eq!(failure_policy(), FailurePolicy::Propagate);
            }

            assert_eq!(failure_policy(), FailurePolicy::Swallow);
        }
        assert_eq!(failure_policy(), before);
    }
}
