//! [`ProjectionConfig`]: the explicit, constructor-threaded configuration a
//! [`crate::projection::CoreProjection`] is built from. Exists so that the
//! handful of tunables the source hangs off static/global state (see Design
//! Note "Global / process-wide state" in the specification this crate
//! implements) are instead ordinary fields passed in at construction time.

use crate::subscription::EventFilter;

/// Configuration for one [`crate::projection::CoreProjection`] instance.
///
/// Every field has a sensible default; construct with [`ProjectionConfig::new`]
/// and override through the builder methods.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Name used to derive the checkpoint, partition-state, and
    /// partition-catalog stream names (`$projections-<name>-*`).
    pub name: String,
    /// Client-side filter applied by the `Subscription` after the source's
    /// own (coarser) server-side selection.
    pub event_filter: EventFilter,
    /// Bytes of unhandled traffic the `Subscription` lets pass before
    /// suggesting a checkpoint.
    pub checkpoint_unhandled_bytes_threshold: u64,
    /// Backpressure limit on the `StagedQueue`; the `Subscription`'s reader
    /// pauses once pending work reaches this.
    pub pending_events_threshold: usize,
    /// Maximum number of `EmittedEvent`s an `EmittedStream` appends in one
    /// batch.
    pub max_write_batch_length: usize,
    /// Whether the projection persists per-partition state and a partition
    /// catalog (`CheckpointManager::partitioned`) rather than only the root
    /// checkpoint.
    pub partitioned: bool,
    /// Whether the projection starts running immediately once state is
    /// loaded and subscribed, or waits in `Stopped` for an explicit `start()`.
    pub start_on_load: bool,
    /// Whether the projection stops (rather than continuing to tail the live
    /// stream) once the underlying source reaches its head.
    pub stop_on_eof: bool,
    /// Bound on the ring buffer of recent `DebugEvent`s kept for
    /// introspection.
    pub debug_event_buffer_size: usize,
}

impl ProjectionConfig {
    /// Creates a configuration for a projection named `name`, with every
    /// other field at its default.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_filter: EventFilter::all(),
            checkpoint_unhandled_bytes_threshold: 1_000_000,
            pending_events_threshold: 1_000,
            max_write_batch_length: 500,
            partitioned: false,
            start_on_load: true,
            stop_on_eof: false,
            debug_event_buffer_size: 100,
        }
    }

    #[must_use]
    pub fn with_event_filter(mut self, event_filter: EventFilter) -> Self {
        self.event_filter = event_filter;
        self
    }

    #[must_use]
    pub fn with_checkpoint_unhandled_bytes_threshold(mut self, threshold: u64) -> Self {
        self.checkpoint_unhandled_bytes_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_pending_events_threshold(mut self, threshold: usize) -> Self {
        self.pending_events_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_write_batch_length(mut self, max_write_batch_length: usize) -> Self {
        self.max_write_batch_length = max_write_batch_length;
        self
    }

    #[must_use]
    pub fn partitioned(mut self) -> Self {
        self.partitioned = true;
        self
    }

    #[must_use]
    pub fn with_start_on_load(mut self, start_on_load: bool) -> Self {
        self.start_on_load = start_on_load;
        self
    }

    #[must_use]
    pub fn with_stop_on_eof(mut self, stop_on_eof: bool) -> Self {
        self.stop_on_eof = stop_on_eof;
        self
    }

    #[must_use]
    pub fn with_debug_event_buffer_size(mut self, size: usize) -> Self {
        self.debug_event_buffer_size = size;
        self
    }
}
