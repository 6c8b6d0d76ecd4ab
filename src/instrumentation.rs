//! Extension types that add `tracing`-based instrumentation, following the
//! `InstrumentedAggregateRepository` decorator pattern this crate's base
//! library uses: wrap the inner component and forward every call through a
//! `#[tracing::instrument]`-annotated span.

use async_trait::async_trait;

use crate::event_source::{
    Error, EventSource, EventStream, ExpectedVersion, NewEvent, ReadStreamSlice, SourceFilter, WriteOutcome,
};

/// An [`EventSource`] decorator that emits a `tracing` span around each of
/// the three operations, named after the method it wraps.
///
/// ```ignore
/// let source = InstrumentedEventSource::new(real_source);
/// let manager = CheckpointManager::new(source, "my-projection");
/// ```
#[derive(Debug, Clone)]
pub struct InstrumentedEventSource<Inner> {
    inner: Inner,
}

impl<Inner> InstrumentedEventSource<Inner> {
    pub fn new(inner: Inner) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<Inner> EventSource for InstrumentedEventSource<Inner>
where
    Inner: EventSource,
{
    #[tracing::instrument(name = "event_source.read_stream_backward", skip(self), fields(stream_id, max_count), err)]
    async fn read_stream_backward(
        &self,
        stream_id: &str,
        from_event_number: i64,
        max_count: usize,
    ) -> Result<ReadStreamSlice, Error> {
        self.inner
            .read_stream_backward(stream_id, from_event_number, max_count)
            .await
    }

    #[tracing::instrument(name = "event_source.append", skip(self, events), fields(stream_id, batch_len = events.len()), err)]
    async fn append(
        &self,
        stream_id: &str,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteOutcome, Error> {
        self.inner.append(stream_id, expected_version, events).await
    }

    #[tracing::instrument(name = "event_source.subscribe_from", skip(self))]
    fn subscribe_from(&self, from_global_position: i64, filter: SourceFilter) -> EventStream {
        self.inner.subscribe_from(from_global_position, filter)
    }
}

/// Logs a projection lifecycle transition at the level appropriate to its
/// destination state: `error` into `Faulted`, `warn` into `Initial` (restart),
/// `info` otherwise.
pub fn log_transition(projection_name: &str, from: &str, to: &str, reason: Option<&str>) {
    match to {
        "Faulted" => tracing::error!(projection = projection_name, from, to, reason, "projection faulted"),
        "Initial" if from != "Initial" => {
            tracing::warn!(projection = projection_name, from, to, reason, "projection restarting")
        }
        _ => tracing::info!(projection = projection_name, from, to, "projection transitioned"),
    }
}
