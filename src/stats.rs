//! Read-only introspection types surfaced by a running
//! [`crate::projection::CoreProjection`]: [`Statistics`] (the
//! `StatisticsReport` upward management message) and [`DebugEvent`] (the
//! `DebugState(events[])` message), both named directly in the
//! specification's external-interfaces section without further shape.

use std::collections::VecDeque;

use crate::tag::CheckpointTag;

/// A point-in-time snapshot of a [`crate::projection::CoreProjection`]'s
/// progress, returned by `CoreProjection::stats()`.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    /// Human-readable name of the projection's current lifecycle state.
    pub state: String,
    /// Total events the `Subscription` has delivered to this projection.
    pub events_processed: u64,
    /// Number of work items currently queued in the `StagedQueue`.
    pub pending_events: usize,
    /// The most recently persisted checkpoint tag, if any.
    pub last_checkpoint_tag: Option<CheckpointTag>,
    /// The highest tag any `EmittedStream` has submitted for write but not
    /// yet committed, across every target stream.
    pub write_queues_length: usize,
    /// The reason this projection is `Faulted`, if it is.
    pub faulted_reason: Option<String>,
}

/// One entry in the bounded ring buffer of recently-processed events kept for
/// development-time introspection (`DebugState`).
#[derive(Debug, Clone)]
pub struct DebugEvent {
    pub partition: String,
    pub tag: CheckpointTag,
    pub stream_id: String,
    pub event_type: String,
    pub handled: bool,
}

/// A fixed-capacity FIFO of the most recent [`DebugEvent`]s; pushing past
/// capacity evicts the oldest entry.
#[derive(Debug)]
pub struct DebugEventBuffer {
    capacity: usize,
    events: VecDeque<DebugEvent>,
}

impl DebugEventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, event: DebugEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Returns every buffered event, oldest first.
    pub fn snapshot(&self) -> Vec<DebugEvent> {
        self.events.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: i64) -> DebugEvent {
        DebugEvent {
            partition: String::new(),
            tag: CheckpointTag::all(n, n),
            stream_id: "foo".into(),
            event_type: "T".into(),
            handled: true,
        }
    }

    #[test]
    fn buffer_evicts_oldest_past_capacity() {
        let mut buffer = DebugEventBuffer::new(2);
        buffer.push(event(1));
        buffer.push(event(2));
        buffer.push(event(3));

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].tag, CheckpointTag::all(2, 2));
        assert_eq!(snapshot[1].tag, CheckpointTag::all(3, 3));
    }
}
