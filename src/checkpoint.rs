//! [`CheckpointManager`]: persists a projection's logical position and user
//! state to a dedicated checkpoint stream, replays it at startup, and gates
//! new checkpoints on every [`crate::emitted_stream::EmittedStream`] having
//! drained its writes up to the checkpointed tag.
//!
//! Modeled as one type with a [`Mode`] rather than a manager hierarchy
//! (see the "polymorphism without inheritance" design note this crate
//! follows): `Default` writes only the checkpoint event; `Partitioned` also
//! persists per-partition state and a partition catalog, sharing every other
//! behavior.

use std::collections::HashSet;
use std::time::Duration;

use uuid::Uuid;

use crate::event_source::{EventSource, ExpectedVersion, NewEvent, ReadStreamResult, WriteOutcome, WriteResult};
use crate::tag::CheckpointTag;

pub const PROJECTION_CHECKPOINT_EVENT_TYPE: &str = "ProjectionCheckpoint";
pub const STATE_UPDATED_EVENT_TYPE: &str = "StateUpdated";
pub const PARTITION_EVENT_TYPE: &str = "$partition";

const LOAD_PAGE_SIZE: usize = 10;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Errors raised while loading or writing checkpoints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A foreign writer touched a stream this manager owns; the projection
    /// must restart.
    #[error("restart requested: {0}")]
    RestartRequested(String),

    #[error("event source error: {0}")]
    Source(#[from] crate::event_source::Error),
}

/// The checkpoint state read back at startup.
#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub tag: CheckpointTag,
    pub state: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Default,
    Partitioned,
}

struct Suggested {
    tag: CheckpointTag,
    state: Vec<u8>,
    partition_states: Vec<(String, CheckpointTag, Vec<u8>)>,
}

/// Returns the well-known checkpoint stream name for a projection.
pub fn checkpoint_stream_name(projection_name: &str) -> String {
    format!("$projections-{projection_name}-checkpoint")
}

/// Returns the well-known partition state stream name for a projection's
/// partition (only used in [`Mode::Partitioned`]).
pub fn partition_state_stream_name(projection_name: &str, partition: &str) -> String {
    format!("$projections-{projection_name}-{partition}-state")
}

/// Returns the well-known partition catalog stream name for a projection
/// (only used in [`Mode::Partitioned`]).
pub fn partition_catalog_stream_name(projection_name: &str) -> String {
    format!("$projections-{projection_name}-partitions")
}

/// Coordinates checkpoint load, persistence, and emit-drain gating for one
/// projection.
pub struct CheckpointManager<S> {
    source: S,
    projection_name: String,
    checkpoint_stream: String,
    partition_catalog_stream: String,
    mode: Mode,
    last_checkpoint_event_number: i64,
    suggested: Option<Suggested>,
    known_partitions: HashSet<String>,
}

impl<S: EventSource> CheckpointManager<S> {
    /// Creates a manager for a root-only (non-partitioned) projection.
    pub fn new(source: S, projection_name: impl Into<String>) -> Self {
        Self::with_mode(source, projection_name, Mode::Default)
    }

    /// Creates a manager that also persists per-partition state and a
    /// partition catalog, for a multi-partition projection.
    pub fn partitioned(source: S, projection_name: impl Into<String>) -> Self {
        Self::with_mode(source, projection_name, Mode::Partitioned)
    }

    fn with_mode(source: S, projection_name: impl Into<String>, mode: Mode) -> Self {
        let projection_name = projection_name.into();
        let checkpoint_stream = checkpoint_stream_name(&projection_name);
        let partition_catalog_stream = partition_catalog_stream_name(&projection_name);

        Self {
            source,
            projection_name,
            checkpoint_stream,
            partition_catalog_stream,
            mode,
            last_checkpoint_event_number: -1,
            suggested: None,
            known_partitions: HashSet::new(),
        }
    }

    /// Reads the checkpoint stream backward in pages of 10, seeking the most
    /// recent `ProjectionCheckpoint` event. Returns the zero tag and empty
    /// state if none exists.
    pub async fn load(&mut self) -> Result<LoadedCheckpoint, Error> {
        let mut from_event_number = -1;

        loop {
            let slice = self
                .source
                .read_stream_backward(&self.checkpoint_stream, from_event_number, LOAD_PAGE_SIZE)
                .await?;

            if slice.result == ReadStreamResult::NoStream {
                return Ok(LoadedCheckpoint {
                    tag: CheckpointTag::Zero,
                    state: Vec::new(),
                });
            }

            for event in &slice.events {
                if self.last_checkpoint_event_number < 0 {
                    self.last_checkpoint_event_number = event.event_number;
                }

                if event.event_type == PROJECTION_CHECKPOINT_EVENT_TYPE {
                    let tag = CheckpointTag::from_metadata(&event.metadata).unwrap_or(CheckpointTag::Zero);
                    return Ok(LoadedCheckpoint {
                        tag,
                        state: event.data.clone(),
                    });
                }
            }

            if slice.next_event_number < 0 {
                break;
            }

            from_event_number = slice.next_event_number;
        }

        Ok(LoadedCheckpoint {
            tag: CheckpointTag::Zero,
            state: Vec::new(),
        })
    }

    /// Parks a checkpoint suggestion at `tag` with `state`, replacing any
    /// earlier unwritten suggestion. Actual persistence happens on
    /// [`Self::try_write`], once the caller reports every emit stream idle up
    /// to this tag.
    pub fn suggest(&mut self, tag: CheckpointTag, state: Vec<u8>) {
        self.suggested = Some(Suggested {
            tag,
            state,
            partition_states: Vec::new(),
        });
    }

    /// Records a partition's state to persist alongside the currently
    /// suggested checkpoint. No-op if no checkpoint is currently suggested,
    /// or in [`Mode::Default`].
    pub fn record_partition_state(&mut self, partition: impl Into<String>, tag: CheckpointTag, state: Vec<u8>) {
        if self.mode != Mode::Partitioned {
            return;
        }

        if let Some(suggested) = &mut self.suggested {
            suggested.partition_states.push((partition.into(), tag, state));
        }
    }

    /// The tag of the currently parked suggestion, if any.
    pub fn suggested_tag(&self) -> Option<&CheckpointTag> {
        self.suggested.as_ref().map(|s| &s.tag)
    }

    /// Attempts to persist the currently suggested checkpoint. `ready` must
    /// be computed by the caller: every `EmittedStream` idle for
    /// `caused_by_tag <= suggested tag`. Returns the committed tag on
    /// success.
    pub async fn try_write(&mut self, ready: bool) -> Result<Option<CheckpointTag>, Error> {
        if !ready {
            return Ok(None);
        }

        let Some(suggested) = self.suggested.take() else {
            return Ok(None);
        };

        if self.mode == Mode::Partitioned {
            for (partition, tag, state) in &suggested.partition_states {
                self.write_partition_state(partition, tag, state.clone()).await?;

                if self.known_partitions.insert(partition.clone()) {
                    self.write_partition_catalog_entry(partition, tag).await?;
                }
            }
        }

        let event = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: PROJECTION_CHECKPOINT_EVENT_TYPE.to_owned(),
            data: suggested.state,
            metadata: suggested.tag.to_metadata(),
        };

        let outcome = self
            .append_with_retry(
                self.checkpoint_stream.clone(),
                ExpectedVersion::Exact(self.last_checkpoint_event_number),
                vec![event],
            )
            .await?;

        self.last_checkpoint_event_number = outcome.first_event_number;

        Ok(Some(suggested.tag))
    }

    async fn write_partition_state(
        &mut self,
        partition: &str,
        tag: &CheckpointTag,
        state: Vec<u8>,
    ) -> Result<(), Error> {
        let stream = partition_state_stream_name(&self.projection_name, partition);

        let event = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: STATE_UPDATED_EVENT_TYPE.to_owned(),
            data: state,
            metadata: tag.to_metadata(),
        };

        self.append_with_retry(stream, ExpectedVersion::Any, vec![event])
            .await?;

        Ok(())
    }

    async fn write_partition_catalog_entry(&mut self, partition: &str, tag: &CheckpointTag) -> Result<(), Error> {
        let event = NewEvent {
            event_id: Uuid::new_v4(),
            event_type: PARTITION_EVENT_TYPE.to_owned(),
            data: partition.as_bytes().to_vec(),
            metadata: tag.to_metadata(),
        };

        self.append_with_retry(self.partition_catalog_stream.clone(), ExpectedVersion::Any, vec![event])
            .await?;

        Ok(())
    }

    async fn append_with_retry(
        &self,
        stream: String,
        expected_version: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<WriteOutcome, Error> {
        loop {
            let outcome = self.source.append(&stream, expected_version, events.clone()).await?;

            match outcome.result {
                WriteResult::Success => return Ok(outcome),
                WriteResult::WrongExpectedVersion => {
                    return Err(Error::RestartRequested(format!("foreign writer detected on {stream:?}")));
                }
                WriteResult::PrepareTimeout | WriteResult::ForwardTimeout | WriteResult::CommitTimeout => {
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
                WriteResult::StreamDeleted | WriteResult::AccessDenied => {
                    return Err(Error::RestartRequested(format!("{:?} on {stream:?}", outcome.result)));
                }
            }
        }
    }

    pub fn last_checkpoint_event_number(&self) -> i64 {
        self.last_checkpoint_event_number
    }
}

#[cfg(test)]
mod tests {
    use crate::event_source::InMemory;

    use super::*;

    #[tokio::test]
    async fn load_returns_zero_tag_when_checkpoint_stream_is_empty() {
        let mut manager = CheckpointManager::new(InMemory::default(), "my-projection");
        let loaded = manager.load().await.unwrap();

        assert_eq!(loaded.tag, CheckpointTag::Zero);
        assert!(loaded.state.is_empty());
    }

    #[tokio::test]
    async fn suggest_then_try_write_persists_checkpoint() {
        let mut manager = CheckpointManager::new(InMemory::default(), "my-projection");

        manager.suggest(CheckpointTag::all(5, 5), b"state".to_vec());
        assert_eq!(manager.suggested_tag(), Some(&CheckpointTag::all(5, 5)));

        let written = manager.try_write(true).await.unwrap();
        assert_eq!(written, Some(CheckpointTag::all(5, 5)));
        assert_eq!(manager.suggested_tag(), None);

        let loaded = manager.load().await.unwrap();
        assert_eq!(loaded.tag, CheckpointTag::all(5, 5));
        assert_eq!(loaded.state, b"state".to_vec());
    }

    #[tokio::test]
    async fn try_write_is_parked_while_not_ready() {
        let mut manager = CheckpointManager::new(InMemory::default(), "my-projection");
        manager.suggest(CheckpointTag::all(1, 1), vec![]);

        let written = manager.try_write(false).await.unwrap();
        assert_eq!(written, None);
        assert!(manager.suggested_tag().is_some());
    }

    #[tokio::test]
    async fn partitioned_mode_writes_partition_state_and_catalog_entry() {
        let source = InMemory::default();
        let mut manager = CheckpointManager::partitioned(source.clone(), "my-projection");

        manager.suggest(CheckpointTag::all(4, 4), b"root".to_vec());
        manager.record_partition_state("P1", CheckpointTag::all(4, 4), b"p1-state".to_vec());

        manager.try_write(true).await.unwrap();

        let state_stream = partition_state_stream_name("my-projection", "P1");
        let slice = source.read_stream_backward(&state_stream, -1, 10).await.unwrap();
        assert_eq!(slice.events.len(), 1);
        assert_eq!(slice.events[0].data, b"p1-state");

        let catalog_stream = partition_catalog_stream_name("my-projection");
        let catalog = source.read_stream_backward(&catalog_stream, -1, 10).await.unwrap();
        assert_eq!(catalog.events.len(), 1);
        assert_eq!(catalog.events[0].data, b"P1");
    }
}
