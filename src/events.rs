//! Data types for events flowing through the runtime: [`Event`], the input
//! record read from the source stream, and [`EmittedEvent`], the output
//! record a [`crate::handler::ProjectionHandler`] produces.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::tag::CheckpointTag;

/// Metadata carried alongside an event's payload. Opaque key-value pairs;
/// the runtime never inspects values beyond a handful of well-known keys
/// (e.g. the serialized [`CheckpointTag`] on emitted events).
pub type Metadata = HashMap<String, String>;

/// A committed event read from the source stream, already resolved past the
/// [`crate::subscription::Subscription`] filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Client-assigned identity of the event, carried through from the
    /// [`crate::event_source::NewEvent`] that produced it.
    pub event_id: Uuid,
    /// The stream this event was committed to.
    pub stream_id: String,
    /// The event's position within `stream_id`.
    pub event_number: i64,
    /// The event's logical type, used for filtering and dispatch.
    pub event_type: String,
    /// Opaque event payload.
    pub data: Vec<u8>,
    /// Opaque event metadata.
    pub metadata: Metadata,
    /// The event's position in the `$all` global log.
    pub global_position: i64,
}

/// A callback invoked exactly once when an [`EmittedEvent`] is committed,
/// receiving the event number it was assigned in the target stream.
pub type OnCommitted = Box<dyn FnOnce(i64) + Send>;

/// An event produced by a [`crate::handler::ProjectionHandler`] while
/// processing an [`Event`], destined for a derived stream.
pub struct EmittedEvent {
    /// The derived stream this event should be appended to.
    pub target_stream: String,
    /// Client-assigned identity for the event, used for idempotent retries.
    pub event_id: Uuid,
    /// The event's logical type.
    pub event_type: String,
    /// Opaque event payload.
    pub data: Vec<u8>,
    /// The input [`CheckpointTag`] whose processing produced this event.
    pub caused_by_tag: CheckpointTag,
    /// The tag the target stream must already reflect before this event is
    /// accepted, used for concurrency detection. `None` means no check.
    pub expected_tag: Option<CheckpointTag>,
    /// Invoked exactly once with the assigned event number once committed.
    pub on_committed: Option<OnCommitted>,
}

impl fmt::Debug for EmittedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmittedEvent")
            .field("target_stream", &self.target_stream)
            .field("event_id", &self.event_id)
            .field("event_type", &self.event_type)
            .field("data_len", &self.data.len())
            .field("caused_by_tag", &self.caused_by_tag)
            .field("expected_tag", &self.expected_tag)
            .field("on_committed", &self.on_committed.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl EmittedEvent {
    /// Creates a new emitted event with no concurrency check and no
    /// commit callback. Use [`EmittedEvent::with_expected_tag`] and
    /// [`EmittedEvent::with_on_committed`] to add those.
    pub fn new(
        target_stream: impl Into<String>,
        event_type: impl Into<String>,
        data: Vec<u8>,
        caused_by_tag: CheckpointTag,
    ) -> Self {
        Self {
            target_stream: target_stream.into(),
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            caused_by_tag,
            expected_tag: None,
            on_committed: None,
        }
    }

    /// Sets the tag the target stream must already reflect before this event
    /// is accepted.
    #[must_use]
    pub fn with_expected_tag(mut self, tag: CheckpointTag) -> Self {
        self.expected_tag = Some(tag);
        self
    }

    /// Sets the callback invoked once this event is committed.
    #[must_use]
    pub fn with_on_committed(mut self, f: impl FnOnce(i64) + Send + 'static) -> Self {
        self.on_committed = Some(Box::new(f));
        self
    }
}
