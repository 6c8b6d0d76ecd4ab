//! Contains [`CheckpointTag`], the opaque, totally-ordered position
//! identifier assigned to every event the [`crate::subscription::Subscription`]
//! lets through, and the [`PositionTagger`] trait used to compute it.
//!
//! A `CheckpointTag` embeds either a global log position (for `$all`-style
//! projections) or a vector of per-stream sequence numbers (for multi-stream
//! projections). Ordering is strict and equality is structural, matching the
//! data model in the specification: for any two events delivered by the
//! `Subscription` in order, their tags must compare strictly increasing.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::{Event, Metadata};

/// Metadata key a `CheckpointTag` is serialized under, wherever this runtime
/// writes one: checkpoint events (the tag itself) and emitted events (their
/// `caused_by_tag`).
pub const METADATA_KEY: &str = "tag";

/// A totally-ordered position identifier.
///
/// [`CheckpointTag::Zero`] is the seed value used before any event has been
/// processed — it compares less than every other tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointTag {
    /// The seed tag, used before any event has been processed.
    Zero,

    /// Position in the `$all` global log, as a (commit, prepare) pair.
    Prepared { commit: i64, prepare: i64 },

    /// Per-stream sequence numbers, for multi-stream or category projections.
    /// Keyed by stream id.
    Streams(BTreeMap<String, i64>),
}

impl CheckpointTag {
    /// Returns a single-stream tag for the given stream at the given event number.
    pub fn single_stream(stream_id: impl Into<String>, event_number: i64) -> Self {
        let mut streams = BTreeMap::new();
        streams.insert(stream_id.into(), event_number);
        CheckpointTag::Streams(streams)
    }

    /// Returns the `$all` tag for the given (commit, prepare) position.
    pub fn all(commit: i64, prepare: i64) -> Self {
        CheckpointTag::Prepared { commit, prepare }
    }

    /// Merges `other` into `self`, keeping the highest sequence number per
    /// stream. Used by multi-stream projections to accumulate a vector tag
    /// across several source streams.
    ///
    /// # Panics
    ///
    /// Panics if `self` and `other` are not both [`CheckpointTag::Streams`]
    /// (or [`CheckpointTag::Zero`]) — mixing tag kinds within one projection
    /// is an invariant violation the caller must not allow.
    #[must_use]
    pub fn merged_with(self, other: &CheckpointTag) -> Self {
        match (self, other) {
            (CheckpointTag::Zero, other) => other.clone(),
            (this, CheckpointTag::Zero) => this,
            (CheckpointTag::Streams(mut mine), CheckpointTag::Streams(theirs)) => {
                for (stream, seq) in theirs {
                    mine.entry(stream.clone())
                        .and_modify(|v| *v = (*v).max(*seq))
                        .or_insert(*seq);
                }
                CheckpointTag::Streams(mine)
            }
            _ => panic!("cannot merge incompatible CheckpointTag variants"),
        }
    }

    /// Serializes this tag into a single-entry [`Metadata`] map under
    /// [`METADATA_KEY`], as JSON.
    pub fn to_metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        // A `CheckpointTag` is always representable as JSON; a failure here
        // would be a bug in this type, not a runtime condition to recover from.
        let encoded = serde_json::to_string(self).expect("CheckpointTag must serialize");
        metadata.insert(METADATA_KEY.to_owned(), encoded);
        metadata
    }

    /// Decodes a tag previously written by [`Self::to_metadata`]. Returns
    /// `None` if the key is absent or the value is not a valid encoding —
    /// the event was not written by this runtime.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        metadata
            .get(METADATA_KEY)
            .and_then(|encoded| serde_json::from_str(encoded).ok())
    }
}

impl PartialOrd for CheckpointTag {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CheckpointTag {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CheckpointTag::Zero, CheckpointTag::Zero) => Ordering::Equal,
            (CheckpointTag::Zero, _) => Ordering::Less,
            (_, CheckpointTag::Zero) => Ordering::Greater,
            (
                CheckpointTag::Prepared { commit: c1, prepare: p1 },
                CheckpointTag::Prepared { commit: c2, prepare: p2 },
            ) => (c1, p1).cmp(&(c2, p2)),
            (CheckpointTag::Streams(a), CheckpointTag::Streams(b)) => {
                let mut keys: Vec<&String> = a.keys().chain(b.keys()).collect();
                keys.sort();
                keys.dedup();

                for key in keys {
                    let left = a.get(key).copied().unwrap_or(-1);
                    let right = b.get(key).copied().unwrap_or(-1);

                    match left.cmp(&right) {
                        Ordering::Equal => continue,
                        ord => return ord,
                    }
                }

                Ordering::Equal
            }
            // Mixed variants are never compared in a well-formed projection;
            // fall back to a stable, arbitrary order rather than panicking,
            // since `Ord` must not panic.
            (CheckpointTag::Prepared { .. }, CheckpointTag::Streams(_)) => Ordering::Greater,
            (CheckpointTag::Streams(_), CheckpointTag::Prepared { .. }) => Ordering::Less,
        }
    }
}

/// Computes the next [`CheckpointTag`] for a delivered [`Event`], given the
/// last tag produced. Pluggable per projection shape: single-stream
/// (event-number), multi-stream (vector), or `$all` ((commit, prepare)).
pub trait PositionTagger: Send + Sync {
    /// Computes the candidate tag for `event`, given the previously produced tag.
    fn tag_for(&self, previous: &CheckpointTag, event: &Event) -> CheckpointTag;

    /// Clones this tagger into a fresh boxed trait object, so a
    /// [`crate::projection::CoreProjection`] can hand a new
    /// [`crate::subscription::Subscription`] its own copy on every restart
    /// without giving up ownership of the one it was constructed with.
    fn clone_box(&self) -> Box<dyn PositionTagger>;
}

/// Tags events by their position in a single source stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleStreamTagger;

impl PositionTagger for SingleStreamTagger {
    fn tag_for(&self, _previous: &CheckpointTag, event: &Event) -> CheckpointTag {
        CheckpointTag::single_stream(event.stream_id.clone(), event.event_number)
    }

    fn clone_box(&self) -> Box<dyn PositionTagger> {
        Box::new(*self)
    }
}

/// Tags events by accumulating a per-stream vector across every stream a
/// category- or multi-stream projection reads from.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiStreamTagger;

impl PositionTagger for MultiStreamTagger {
    fn tag_for(&self, previous: &CheckpointTag, event: &Event) -> CheckpointTag {
        let this_event = CheckpointTag::single_stream(event.stream_id.clone(), event.event_number);
        previous.clone().merged_with(&this_event)
    }

    fn clone_box(&self) -> Box<dyn PositionTagger> {
        Box::new(*self)
    }
}

/// Tags events by their position in the `$all` global log.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllStreamTagger;

impl PositionTagger for AllStreamTagger {
    fn tag_for(&self, _previous: &CheckpointTag, event: &Event) -> CheckpointTag {
        CheckpointTag::all(event.global_position, event.global_position)
    }

    fn clone_box(&self) -> Box<dyn PositionTagger> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_less_than_everything() {
        assert!(CheckpointTag::Zero < CheckpointTag::single_stream("foo", 0));
        assert!(CheckpointTag::Zero < CheckpointTag::all(1, 1));
        assert_eq!(CheckpointTag::Zero, CheckpointTag::Zero);
    }

    #[test]
    fn single_stream_tags_order_by_event_number() {
        let t0 = CheckpointTag::single_stream("foo", 0);
        let t1 = CheckpointTag::single_stream("foo", 1);

        assert!(t0 < t1);
    }

    #[test]
    fn prepared_tags_order_by_commit_then_prepare() {
        assert!(CheckpointTag::all(10, 5) < CheckpointTag::all(11, 0));
        assert!(CheckpointTag::all(10, 5) < CheckpointTag::all(10, 6));
    }

    #[test]
    fn merging_keeps_highest_sequence_per_stream() {
        let a = CheckpointTag::single_stream("foo", 3);
        let b = CheckpointTag::single_stream("bar", 1);

        let merged = a.merged_with(&b);

        match merged {
            CheckpointTag::Streams(streams) => {
                assert_eq!(streams.get("foo"), Some(&3));
                assert_eq!(streams.get("bar"), Some(&1));
            }
            other => panic!("expected Streams tag, got {other:?}"),
        }
    }

    #[test]
    fn multi_stream_tagger_accumulates_across_events() {
        let tagger = MultiStreamTagger;

        let e1 = Event {
            event_id: uuid::Uuid::new_v4(),
            stream_id: "foo".into(),
            event_number: 0,
            event_type: "T".into(),
            data: vec![],
            metadata: Default::default(),
            global_position: 100,
        };
        let e2 = Event {
            event_id: uuid::Uuid::new_v4(),
            stream_id: "bar".into(),
            event_number: 0,
            event_type: "T".into(),
            data: vec![],
            metadata: Default::default(),
            global_position: 101,
        };

        let t1 = tagger.tag_for(&CheckpointTag::Zero, &e1);
        let t2 = tagger.tag_for(&t1, &e2);

        assert!(t1 < t2);

        if let CheckpointTag::Streams(streams) = &t2 {
            assert_eq!(streams.get("foo"), Some(&0));
            assert_eq!(streams.get("bar"), Some(&0));
        } else {
            panic!("expected Streams tag");
        }
    }
}
