//! Error types for graph construction and sink usage.
//!
//! Every variant is a protocol violation: the graph was composed in a way the
//! engine cannot honour. The `try_*` entry points return these as `Err`, the
//! plain entry points raise them through [`violation`].

use tracing::error;

/// Errors raised when the propagation protocol is misused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrpError {
    /// A sink was sent a value from inside a propagation callback.
    #[error("send() may not be called inside a propagation callback")]
    SendInCallback,

    /// A `StreamLoop` or `CellLoop` was resolved twice.
    #[error("loop was looped more than once")]
    LoopedTwice,

    /// A `CellLoop` was sampled before it was resolved.
    #[error("CellLoop was sampled before it was looped")]
    LoopSampledBeforeResolved,

    /// A loop was created without an explicit transaction.
    #[error("StreamLoop and CellLoop must be created within an explicit transaction")]
    LoopOutsideTransaction,

    /// A sink without a fold function received two values in one transaction.
    #[error("send() was called more than once in a transaction on a sink without a fold function")]
    UncoalescedSend,
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, FrpError>;

/// Raise a protocol violation.
///
/// The panic payload is the [`FrpError`] itself so callers can recover it with
/// `downcast_ref::<FrpError>()`. The transaction drain loop recognises this
/// payload and always propagates it, whatever the failure policy says.
pub fn violation(err: FrpError) -> ! {
    error!(error = %err, "protocol violation");
    std::panic::panic_any(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn violation_payload_is_the_error() {
        let payload = panic::catch_unwind(|| violation(FrpError::LoopedTwice)).unwrap_err();
        assert_eq!(payload.downcast_ref::<FrpError>(), Some(&FrpError::LoopedTwice));
    }

    #[test]
    fn messages_name_the_operation() {
        assert!(FrpError::SendInCallback.to_string().contains("send()"));
        assert!(FrpError::LoopSampledBeforeResolved.to_string().contains("sampled"));
    }
}
