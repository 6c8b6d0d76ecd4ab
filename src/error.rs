//! [`FaultReason`]: the top-level taxonomy a [`crate::projection::CoreProjection`]
//! carries in its `Faulted` state, composing with `anyhow`-boundary code the
//! same way the base crate's repository decorators do.

use crate::tag::CheckpointTag;

/// Why a projection transitioned to `Faulted`.
#[derive(Debug, thiserror::Error)]
pub enum FaultReason {
    /// A write timed out; surfaced only via statistics elsewhere — this
    /// variant exists for completeness of the taxonomy, not because a
    /// timeout alone ever faults a projection (it retries indefinitely).
    #[error("transient write timeout: {0}")]
    TransientWriteTimeout(String),

    /// A `WrongExpectedVersion` was observed on a projection-owned stream.
    /// Recoverable by restarting, which this variant's callers already do
    /// before a fault is ever recorded from it.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Out-of-order messages, broken stage ordering, a cache lock conflict,
    /// or a recovery mismatch between an emitted event and its committed
    /// predecessor. Not recoverable without operator intervention.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// The handler raised an error while processing an event.
    #[error("handler exception at tag {tag:?}: {source}")]
    HandlerException {
        tag: CheckpointTag,
        #[source]
        source: anyhow::Error,
    },

    /// An event-store result code outside the documented set.
    #[error("unsupported result: {0}")]
    UnsupportedResult(String),
}

impl From<crate::emitted_stream::Error> for FaultReason {
    fn from(err: crate::emitted_stream::Error) -> Self {
        match err {
            crate::emitted_stream::Error::RestartRequested(msg) => FaultReason::ConcurrencyConflict(msg),
            crate::emitted_stream::Error::Source(source) => FaultReason::UnsupportedResult(source.to_string()),
        }
    }
}

impl From<crate::checkpoint::Error> for FaultReason {
    fn from(err: crate::checkpoint::Error) -> Self {
        match err {
            crate::checkpoint::Error::RestartRequested(msg) => FaultReason::ConcurrencyConflict(msg),
            crate::checkpoint::Error::Source(source) => FaultReason::UnsupportedResult(source.to_string()),
        }
    }
}
