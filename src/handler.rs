//! [`ProjectionHandler`]: the user-supplied fold logic the runtime drives.
//! Not implemented by this crate — it is the one external collaborator a
//! caller must provide.

use async_trait::async_trait;
use uuid::Uuid;

use crate::events::{EmittedEvent, Metadata};
use crate::tag::CheckpointTag;

/// The input passed to [`ProjectionHandler::process_event`] for a single
/// committed event, already resolved past the [`crate::subscription::Subscription`]
/// filter and assigned its [`CheckpointTag`].
#[derive(Debug, Clone)]
pub struct ProcessEventInput<'a> {
    /// The partition key this event was resolved to.
    pub partition: &'a str,
    /// The checkpoint tag assigned to this event.
    pub tag: &'a CheckpointTag,
    pub stream_id: &'a str,
    pub event_type: &'a str,
    /// The stream's category (the stream id prefix up to the first `-`).
    pub category: &'a str,
    pub event_id: Uuid,
    pub event_number: i64,
    pub metadata: &'a Metadata,
    pub data: &'a [u8],
}

/// The result of folding one event over the handler's currently loaded
/// state.
#[derive(Debug, Default)]
pub struct ProcessEventOutput {
    /// The partition's state after folding this event, to be cached and
    /// eventually checkpointed.
    pub new_state: Vec<u8>,
    /// Events to append to derived streams as a result of processing this
    /// event.
    pub emitted: Vec<EmittedEvent>,
    /// Whether this event was actually handled (mapped to output) by the
    /// handler, as opposed to merely having reached it. Unhandled events
    /// still advance the checkpoint tag but produce no state change.
    pub handled: bool,
}

/// The user-supplied projection: a deterministic fold from events into state
/// and, optionally, emitted events.
///
/// A [`CoreProjection`](crate::projection::CoreProjection) drives exactly one
/// handler instance per partition conceptually, by calling
/// [`ProjectionHandler::load`] with the partition's cached state before each
/// [`ProjectionHandler::process_event`] call — the handler itself need not
/// track which partition it is currently folding.
#[async_trait]
pub trait ProjectionHandler: Send + Sync {
    /// Error type surfaced to the runtime on handler failure. Caught at the
    /// single call site in stage 2 of the `StagedQueue` and converted into a
    /// `HandlerException` fault.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Called once before the handler processes any event, analogous to a
    /// constructor run on the projection's cooperative worker rather than at
    /// handler-construction time.
    async fn initialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Loads a previously-checkpointed (or cached) state blob as the
    /// handler's current working state, ahead of a [`Self::process_event`]
    /// call for the same partition.
    async fn load(&mut self, state: &[u8]) -> Result<(), Self::Error>;

    /// Folds `input` over the handler's currently loaded state, returning
    /// the new state and any events to emit.
    async fn process_event(
        &mut self,
        input: ProcessEventInput<'_>,
    ) -> Result<ProcessEventOutput, Self::Error>;

    /// Called once when the projection is torn down (on stop or restart),
    /// releasing any resources acquired in [`Self::initialize`].
    async fn dispose(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}
