//! [`EmittedStream`]: delivers batches of [`EmittedEvent`]s to one target
//! stream, in `caused_by_tag` order, idempotently under restart, detecting
//! outside writers.

use std::collections::VecDeque;
use std::time::Duration;

use crate::event_source::{EventSource, ExpectedVersion, NewEvent, ReadStreamResult, WriteResult};
use crate::events::EmittedEvent;
use crate::tag::CheckpointTag;

const RECOVERY_PAGE_SIZE: usize = 100;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Errors raised while recovering or writing to a target stream.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A foreign writer touched the target stream, or a recovered event
    /// didn't match a re-emitted one — the owning projection must restart.
    #[error("restart requested: {0}")]
    RestartRequested(String),

    /// Any other store-level failure; fatal.
    #[error("event source error: {0}")]
    Source(#[from] crate::event_source::Error),
}

struct SeenEvent {
    tag: CheckpointTag,
    event_type: String,
    event_number: i64,
}

/// Per-derived-stream writer. One instance exists per target stream a
/// projection has ever emitted to, created lazily on first emit and torn
/// down with the projection.
pub struct EmittedStream<S> {
    source: S,
    target_stream: String,
    max_write_batch_length: usize,
    recovered: bool,
    last_committed_tag: CheckpointTag,
    last_known_event_number: i64,
    last_submitted_or_committed_tag: CheckpointTag,
    seen_stack: Vec<SeenEvent>,
    pending: VecDeque<EmittedEvent>,
}

impl<S: EventSource> EmittedStream<S> {
    /// Creates a writer for `target_stream`. Recovery does not happen until
    /// the first [`Self::drain`] call.
    pub fn new(source: S, target_stream: impl Into<String>) -> Self {
        Self {
            source,
            target_stream: target_stream.into(),
            max_write_batch_length: 500,
            recovered: false,
            last_committed_tag: CheckpointTag::Zero,
            last_known_event_number: -1,
            last_submitted_or_committed_tag: CheckpointTag::Zero,
            seen_stack: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn with_max_write_batch_length(mut self, max_write_batch_length: usize) -> Self {
        self.max_write_batch_length = max_write_batch_length;
        self
    }

    /// Reads the target stream backward from its tail, collecting every
    /// event this runtime previously wrote (identified by a decodable
    /// `caused_by_tag` in its metadata) onto the seen stack, oldest on top.
    /// Stops at the stream head or at the first event lacking that
    /// metadata — the boundary past which nothing could possibly be
    /// re-emitted.
    async fn recover(&mut self) -> Result<(), Error> {
        let mut from_event_number = -1;
        let mut last_committed_tag = None;
        let mut collected = Vec::new();

        'paging: loop {
            let slice = self
                .source
                .read_stream_backward(&self.target_stream, from_event_number, RECOVERY_PAGE_SIZE)
                .await?;

            if slice.result == ReadStreamResult::NoStream {
                break;
            }

            for event in &slice.events {
                if self.last_known_event_number < 0 {
                    self.last_known_event_number = event.event_number;
                }

                let Some(tag) = CheckpointTag::from_metadata(&event.metadata) else {
                    break 'paging;
                };

                if last_committed_tag.is_none() {
                    last_committed_tag = Some(tag.clone());
                }

                collected.push(SeenEvent {
                    tag,
                    event_type: event.event_type.clone(),
                    event_number: event.event_number,
                });
            }

            if slice.next_event_number < 0 {
                break;
            }

            from_event_number = slice.next_event_number;
        }

        self.last_committed_tag = last_committed_tag.unwrap_or(CheckpointTag::Zero);
        self.seen_stack = collected;
        self.recovered = true;

        Ok(())
    }

    async fn ensure_recovered(&mut self) -> Result<(), Error> {
        if !self.recovered {
            self.recover().await?;
        }
        Ok(())
    }

    /// Submits an event for eventual write, performing the concurrency-
    /// violation check immediately: an `expected_tag` behind the last
    /// submitted-or-committed tag indicates a conflicting writer.
    pub fn submit(&mut self, event: EmittedEvent) -> Result<(), Error> {
        if let Some(expected) = &event.expected_tag {
            if *expected < self.last_submitted_or_committed_tag {
                return Err(Error::RestartRequested(format!(
                    "emit to {:?} expected tag {:?} but {:?} was already submitted or committed",
                    self.target_stream, expected, self.last_submitted_or_committed_tag
                )));
            }
        }

        self.last_submitted_or_committed_tag = event.caused_by_tag.clone();
        self.pending.push_back(event);

        Ok(())
    }

    /// Drains as much pending work as this stream can currently make
    /// progress on: recovery dedup first (matching re-emitted events against
    /// the seen stack), then live batched writes once the stack is drained.
    pub async fn drain(&mut self) -> Result<(), Error> {
        self.ensure_recovered().await?;

        while let Some(front) = self.pending.front() {
            if front.caused_by_tag > self.last_committed_tag || self.seen_stack.is_empty() {
                break;
            }

            let event = self.pending.pop_front().expect("front just checked");

            let Some(top) = self.seen_stack.pop() else {
                return Err(Error::RestartRequested(format!(
                    "no recovered event left in {:?} to match re-emitted event at tag {:?}",
                    self.target_stream, event.caused_by_tag
                )));
            };

            if top.tag != event.caused_by_tag || top.event_type != event.event_type {
                return Err(Error::RestartRequested(format!(
                    "recovered event in {:?} at tag {:?} does not match re-emitted event type {}",
                    self.target_stream, top.tag, event.event_type
                )));
            }

            if let Some(on_committed) = event.on_committed {
                on_committed(top.event_number);
            }
        }

        if !self.seen_stack.is_empty() {
            // Still have recovered events ahead of whatever is pending;
            // nothing further to do until more items arrive.
            return Ok(());
        }

        while !self.pending.is_empty() {
            let batch_len = self.pending.len().min(self.max_write_batch_length);
            let batch: Vec<EmittedEvent> = self.pending.drain(..batch_len).collect();

            let new_events: Vec<NewEvent> = batch
                .iter()
                .map(|event| NewEvent {
                    event_id: event.event_id,
                    event_type: event.event_type.clone(),
                    data: event.data.clone(),
                    metadata: event.caused_by_tag.to_metadata(),
                })
                .collect();

            loop {
                let outcome = self
                    .source
                    .append(
                        &self.target_stream,
                        ExpectedVersion::Exact(self.last_known_event_number),
                        new_events.clone(),
                    )
                    .await?;

                match outcome.result {
                    WriteResult::Success => {
                        self.last_known_event_number = outcome.first_event_number + batch.len() as i64 - 1;

                        for (i, event) in batch.into_iter().enumerate() {
                            if let Some(on_committed) = event.on_committed {
                                on_committed(outcome.first_event_number + i as i64);
                            }
                        }

                        break;
                    }
                    WriteResult::WrongExpectedVersion => {
                        return Err(Error::RestartRequested(format!(
                            "foreign writer detected on {:?}",
                            self.target_stream
                        )));
                    }
                    WriteResult::PrepareTimeout
                    | WriteResult::ForwardTimeout
                    | WriteResult::CommitTimeout => {
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    WriteResult::StreamDeleted | WriteResult::AccessDenied => {
                        return Err(Error::RestartRequested(format!(
                            "{:?} on {:?}",
                            outcome.result, self.target_stream
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Reports whether this stream has no pending writes and no in-flight
    /// recovery dedup left — the signal the `CheckpointManager` uses to
    /// decide when a checkpoint may proceed.
    pub fn is_idle(&self) -> bool {
        self.recovered && self.seen_stack.is_empty() && self.pending.is_empty()
    }

    /// The highest `caused_by_tag` submitted so far, used by the
    /// `CheckpointManager` to decide which checkpoints this stream still
    /// blocks.
    pub fn pending_up_to_tag(&self) -> Option<&CheckpointTag> {
        self.pending.back().map(|event| &event.caused_by_tag)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    use crate::event_source::InMemory;

    use super::*;

    #[tokio::test]
    async fn first_emit_drains_immediately_on_empty_stream() {
        let source = InMemory::default();
        let mut stream = EmittedStream::new(source, "$out");

        let tag = CheckpointTag::all(1, 1);
        let committed = Arc::new(AtomicI64::new(-1));
        let committed_clone = committed.clone();

        stream
            .submit(
                EmittedEvent::new("$out", "T", b"a".to_vec(), tag)
                    .with_on_committed(move |n| committed_clone.store(n, Ordering::SeqCst)),
            )
            .unwrap();

        stream.drain().await.unwrap();

        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert!(stream.is_idle());
    }

    #[tokio::test]
    async fn recovery_dedups_against_already_committed_events() {
        let source = InMemory::default();

        let t0_minus = CheckpointTag::all(9, 9);
        let t0 = CheckpointTag::all(10, 10);
        let t0_plus = CheckpointTag::all(11, 11);

        source
            .append(
                "$out",
                ExpectedVersion::Any,
                vec![
                    NewEvent {
                        event_id: uuid::Uuid::new_v4(),
                        event_type: "X".into(),
                        data: vec![],
                        metadata: t0_minus.to_metadata(),
                    },
                    NewEvent {
                        event_id: uuid::Uuid::new_v4(),
                        event_type: "X".into(),
                        data: vec![],
                        metadata: t0_plus.to_metadata(),
                    },
                ],
            )
            .await
            .unwrap();

        let mut stream = EmittedStream::new(source, "$out");

        let committed0 = Arc::new(AtomicI64::new(-1));
        let committed1 = Arc::new(AtomicI64::new(-1));
        let c0 = committed0.clone();
        let c1 = committed1.clone();

        stream
            .submit(
                EmittedEvent::new("$out", "X", vec![], t0_minus.clone())
                    .with_on_committed(move |n| c0.store(n, Ordering::SeqCst)),
            )
            .unwrap();
        stream
            .submit(
                EmittedEvent::new("$out", "X", vec![], t0_plus.clone())
                    .with_on_committed(move |n| c1.store(n, Ordering::SeqCst)),
            )
            .unwrap();
        stream
            .submit(EmittedEvent::new("$out", "X", vec![], t0))
            .unwrap();

        stream.drain().await.unwrap();

        assert_eq!(committed0.load(Ordering::SeqCst), 0);
        assert_eq!(committed1.load(Ordering::SeqCst), 1);
        // The third emit (tag > last_committed_tag) should have been
        // appended live, landing at event number 2.
        assert_eq!(stream.last_known_event_number, 2);
    }

    #[tokio::test]
    async fn foreign_write_surfaces_as_restart_requested() {
        let source = InMemory::default();
        let mut stream = EmittedStream::new(source.clone(), "$out");

        stream
            .submit(EmittedEvent::new("$out", "T", vec![], CheckpointTag::all(1, 1)))
            .unwrap();
        stream.drain().await.unwrap();

        // A foreign writer appends without going through the stream.
        source
            .append("$out", ExpectedVersion::Any, vec![NewEvent::new("Foreign", vec![])])
            .await
            .unwrap();

        stream
            .submit(EmittedEvent::new("$out", "T", vec![], CheckpointTag::all(2, 2)))
            .unwrap();

        let result = stream.drain().await;
        assert!(matches!(result, Err(Error::RestartRequested(_))));
    }

    #[tokio::test]
    async fn expected_tag_behind_submitted_tag_is_rejected() {
        let source = InMemory::default();
        let mut stream = EmittedStream::new(source, "$out");

        stream
            .submit(EmittedEvent::new("$out", "T", vec![], CheckpointTag::all(5, 5)))
            .unwrap();

        let result = stream.submit(
            EmittedEvent::new("$out", "T", vec![], CheckpointTag::all(6, 6))
                .with_expected_tag(CheckpointTag::all(1, 1)),
        );

        assert!(matches!(result, Err(Error::RestartRequested(_))));
    }
}
