//! The event log storage engine, consumed by this crate only through the
//! [`EventSource`] trait: *read-stream-backward*, *append-events*, and
//! *subscribe-from-position*. A real implementation (a network client talking
//! to the actual event store process) is out of scope for this crate; the
//! [`InMemory`] implementation here exists purely so the runtime is testable
//! end-to-end without one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::events::{Event, Metadata};

/// Optimistic-concurrency check applied by [`EventSource::append`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Append regardless of the stream's current last event number.
    Any,
    /// Append only if the stream's current last event number is exactly this.
    Exact(i64),
}

/// A single event to append, before it has been assigned a position.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Client-assigned identity, used by the store for idempotent append retries.
    pub event_id: Uuid,
    /// The event's logical type.
    pub event_type: String,
    /// Opaque event payload.
    pub data: Vec<u8>,
    /// Opaque event metadata.
    pub metadata: Metadata,
}

impl NewEvent {
    /// Creates a new event with empty metadata and a fresh random id.
    pub fn new(event_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            metadata: Metadata::default(),
        }
    }

    /// Sets this event's metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Outcome of a [`EventSource::read_stream_backward`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStreamResult {
    /// The read succeeded; `events` contains the requested slice.
    Success,
    /// The stream has never been written to.
    NoStream,
    /// The stream existed but has since been (soft-)deleted.
    StreamDeleted,
    /// The stream has not changed since the caller's last known state.
    NotModified,
}

/// A slice of a stream, read backward from a given event number.
#[derive(Debug, Clone)]
pub struct ReadStreamSlice {
    /// Events in the slice, in the order the store returned them (backward:
    /// highest event number first).
    pub events: Vec<Event>,
    /// The event number to continue reading backward from, if any remain.
    pub next_event_number: i64,
    pub result: ReadStreamResult,
}

/// Outcome of a [`EventSource::append`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// The append succeeded.
    Success,
    /// `expected_version` did not match the stream's actual last event number
    /// — another writer has appended to this stream.
    WrongExpectedVersion,
    /// The store timed out preparing the write; safe to retry the same batch.
    PrepareTimeout,
    /// The store timed out forwarding the write to the leader; safe to retry.
    ForwardTimeout,
    /// The store timed out committing the write; safe to retry.
    CommitTimeout,
    /// The target stream has been (hard-)deleted.
    StreamDeleted,
    /// The caller lacks permission to write to this stream.
    AccessDenied,
}

/// Result of a successful or failed append.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub result: WriteResult,
    /// The event number assigned to the first event in the batch, valid only
    /// when `result` is [`WriteResult::Success`].
    pub first_event_number: i64,
}

/// Errors returned by [`EventSource`] operations that the documented result
/// codes don't account for. Any result code outside the documented set is
/// fatal — see [`crate::error::FaultReason::UnsupportedResult`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("event source returned an unsupported result: {0}")]
    Unsupported(String),
    #[error("event source request failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// Server-side selection applied by [`EventSource::subscribe_from`], narrowing
/// the delivered stream before it reaches the [`crate::subscription::Subscription`]
/// filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceFilter {
    /// Deliver every committed event (the `$all` stream).
    All,
    /// Deliver only events committed to the given stream.
    Stream(String),
    /// Deliver only events committed to streams in the given category
    /// (by convention, a stream name prefix up to the first `-`).
    Category(String),
}

/// A committed event delivered by a live subscription, carrying the source's
/// self-reported catch-up progress (0.0-100.0, `None` once live).
#[derive(Debug, Clone)]
pub struct CommittedEventDistributed {
    pub event: Event,
    pub progress: Option<f32>,
}

/// Stream of events returned by [`EventSource::subscribe_from`].
pub type EventStream = BoxStream<'static, Result<CommittedEventDistributed, Error>>;

/// The event log storage engine. Exposes only the three operations the core
/// projection runtime needs: reading a stream backward (used by recovery),
/// appending events (used by emits and checkpoints), and subscribing from a
/// position (used by the [`crate::subscription::Subscription`]).
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Reads up to `max_count` events from `stream_id`, backward starting at
    /// `from_event_number` (or the stream's head, if `from_event_number` is
    /// negative).
    async fn read_stream_backward(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice, Error>;

    /// Appends `events` to `stream_id`, subject to `expected_version`.
    async fn append(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteOutcome, Error>;

    /// Opens a live subscription delivering every event matching `filter`
    /// from `position` onward. `position` is a store-specific encoding of a
    /// [`crate::tag::CheckpointTag`]; callers are expected to track their own
    /// starting position and decode accordingly.
    fn subscribe_from(&self, from_global_position: i64, filter: SourceFilter) -> EventStream;
}

#[derive(Debug, Default)]
struct Backend {
    streams: HashMap<String, Vec<Event>>,
}

/// An in-memory [`EventSource`], backed by a `HashMap` and a broadcast
/// channel for live subscriptions. Exists for tests and local development,
/// not for production use.
#[derive(Clone)]
pub struct InMemory {
    backend: Arc<RwLock<Backend>>,
    global_position: Arc<AtomicI64>,
    tx: broadcast::Sender<Event>,
}

impl Default for InMemory {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemory {
    /// Creates a new store with the given broadcast channel capacity for
    /// live subscriptions (events appended while no receiver has caught up
    /// beyond this many pending events are dropped from that receiver's
    /// perspective — see [`tokio::sync::broadcast`]).
    pub fn new(subscribe_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(subscribe_capacity);
        Self {
            backend: Arc::default(),
            global_position: Arc::new(AtomicI64::new(0)),
            tx,
        }
    }

    fn matches(filter: &SourceFilter, event: &Event) -> bool {
        match filter {
            SourceFilter::All => true,
            SourceFilter::Stream(stream_id) => &event.stream_id == stream_id,
            SourceFilter::Category(category) => event
                .stream_id
                .split('-')
                .next()
                .is_some_and(|prefix| prefix == category),
        }
    }
}

#[async_trait]
impl EventSource for InMemory {
    async fn read_stream_backward(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice, Error> {
        let backend = self.backend.read();

        let Some(events) = backend.streams.get(stream_id) else {
            return Ok(ReadStreamSlice {
                events: vec![],
                next_event_number: -1,
                result: ReadStreamResult::NoStream,
            });
        };

        let head = if from_event_number < 0 {
            events.len() as i64 - 1
        } else {
            from_event_number.min(events.len() as i64 - 1)
        };

        if head < 0 {
            return Ok(ReadStreamSlice {
                events: vec![],
                next_event_number: -1,
                result: ReadStreamResult::NoStream,
            });
        }

        let start = (head + 1 - max_count as i64).max(0) as usize;
        let mut slice: Vec<Event> = events[start..=(head as usize)].to_vec();
        slice.reverse();

        let next_event_number = start as i64 - 1;

        Ok(ReadStreamSlice {
            events: slice,
            next_event_number,
            result: ReadStreamResult::Success,
        })
    }

    async fn append(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteOutcome, Error> {
        let mut backend = self.backend.write();

        let current_last = backend
            .streams
            .get(stream_id)
            .and_then(|events| events.last())
            .map_or(-1, |event| event.event_number);

        if let ExpectedVersion::Exact(expected) = expected_version {
            if expected != current_last {
                return Ok(WriteOutcome {
                    result: WriteResult::WrongExpectedVersion,
                    first_event_number: -1,
                });
            }
        }

        let first_event_number = current_last + 1;
        let mut persisted = Vec::with_capacity(events.len());

        for (i, new_event) in events.into_iter().enumerate() {
            let global_position = self.global_position.fetch_add(1, Ordering::SeqCst);

            persisted.push(Event {
                event_id: new_event.event_id,
                stream_id: stream_id.to_owned(),
                event_number: first_event_number + i as i64,
                event_type: new_event.event_type,
                data: new_event.data,
                metadata: new_event.metadata,
                global_position,
            });
        }

        for event in &persisted {
            // No active subscribers is not an error for an append.
            let _ = self.tx.send(event.clone());
        }

        backend
            .streams
            .entry(stream_id.to_owned())
            .or_default()
            .extend(persisted);

        Ok(WriteOutcome {
            result: WriteResult::Success,
            first_event_number,
        })
    }

    fn subscribe_from(&self, from_global_position: i64, filter: SourceFilter) -> EventStream {
        // Subscribe to the live broadcast channel *before* taking the
        // historical snapshot, so nothing committed between the two can fall
        // into the gap and be missed entirely. This can only ever produce
        // duplicates (an event caught by both the snapshot and the live
        // receiver), never a miss; duplicates are then filtered out by
        // position below, and `Subscription`'s own replay dedup would catch
        // any that slipped through regardless.
        let rx = self.tx.subscribe();

        let backend = self.backend.read();

        let mut historical: Vec<Event> = backend
            .streams
            .values()
            .flatten()
            .filter(|event| event.global_position >= from_global_position)
            .cloned()
            .collect();

        historical.sort_by_key(|event| event.global_position);
        drop(backend);

        let last_historical_position = historical
            .last()
            .map_or(from_global_position - 1, |event| event.global_position);

        let live = BroadcastStream::new(rx).filter_map(|item| async move { item.ok() });

        let filter_historical = filter.clone();
        let historical_stream = stream::iter(historical).filter(move |event| {
            let matches = Self::matches(&filter_historical, event);
            async move { matches }
        });

        let live_stream = live.filter(move |event| {
            let matches = event.global_position > last_historical_position && Self::matches(&filter, event);
            async move { matches }
        });

        historical_stream
            .chain(live_stream)
            .map(|event| {
                Ok(CommittedEventDistributed {
                    event,
                    progress: None,
                })
            })
            .boxed()
    }
}
