//! [`PartitionStateCache`]: an in-memory map from partition key to cached
//! state, with tag-based locks that prevent a partition's state from being
//! reacquired out from under work still in flight for an earlier tag.

use std::collections::HashMap;

use crate::tag::CheckpointTag;

/// Key denoting the root (and, for non-partitioned projections, only)
/// partition.
pub const ROOT_PARTITION: &str = "";

struct Entry {
    state: Vec<u8>,
    caused_by_tag: CheckpointTag,
    lock_tag: Option<CheckpointTag>,
}

/// Caches partition state in memory, gated by tag-based locks so that state
/// still referenced by uncheckpointed work is never evicted or reacquired at
/// a conflicting position.
pub struct PartitionStateCache {
    entries: HashMap<String, Entry>,
}

impl Default for PartitionStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionStateCache {
    /// Creates a cache with the root partition pre-seeded at the zero tag,
    /// always cached and implicitly locked.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            ROOT_PARTITION.to_owned(),
            Entry {
                state: Vec::new(),
                caused_by_tag: CheckpointTag::Zero,
                lock_tag: Some(CheckpointTag::Zero),
            },
        );

        Self { entries }
    }

    /// Returns the cached state for `partition`, but only if it is currently
    /// locked. Returns `None` for an unlocked or absent partition.
    pub fn get_locked(&self, partition: &str) -> Option<&[u8]> {
        self.entries
            .get(partition)
            .filter(|entry| entry.lock_tag.is_some())
            .map(|entry| entry.state.as_slice())
    }

    /// Acquires a lock on `partition` at `at_tag`, returning its cached
    /// state. Returns `None` if the partition is not cached, or if it is
    /// already locked at a different tag (unless `allow_relock_same_position`
    /// permits idempotent re-acquisition at the same tag).
    pub fn try_lock_at(
        &mut self,
        partition: &str,
        at_tag: &CheckpointTag,
        allow_relock_same_position: bool,
    ) -> Option<&[u8]> {
        let entry = self.entries.get_mut(partition)?;

        match &entry.lock_tag {
            None => {
                entry.lock_tag = Some(at_tag.clone());
                Some(entry.state.as_slice())
            }
            Some(locked_at) if allow_relock_same_position && locked_at == at_tag => {
                Some(entry.state.as_slice())
            }
            Some(_) => None,
        }
    }

    /// Stores `state` under `partition`, caused by `caused_by_tag`, locking
    /// it at `lock_at_tag` if given.
    pub fn cache_and_lock(
        &mut self,
        partition: impl Into<String>,
        state: Vec<u8>,
        caused_by_tag: CheckpointTag,
        lock_at_tag: Option<CheckpointTag>,
    ) {
        self.entries.insert(
            partition.into(),
            Entry {
                state,
                caused_by_tag,
                lock_tag: lock_at_tag,
            },
        );
    }

    /// Releases every lock held at a tag `<= up_to_tag`. Called after a
    /// checkpoint completes at that tag, never earlier. The root partition
    /// is never unlocked or evicted.
    pub fn unlock(&mut self, up_to_tag: &CheckpointTag) {
        for (partition, entry) in self.entries.iter_mut() {
            if partition == ROOT_PARTITION {
                continue;
            }

            if matches!(&entry.lock_tag, Some(lock_tag) if lock_tag <= up_to_tag) {
                entry.lock_tag = None;
            }
        }
    }

    /// Returns the tag that produced the currently cached state for
    /// `partition`, if any.
    pub fn caused_by_tag(&self, partition: &str) -> Option<&CheckpointTag> {
        self.entries.get(partition).map(|entry| &entry.caused_by_tag)
    }

    /// Returns every partition key with a cached entry, for management
    /// introspection (`StateReport`).
    pub fn partitions(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_partition_is_preseeded_and_locked() {
        let cache = PartitionStateCache::new();
        assert_eq!(cache.get_locked(ROOT_PARTITION), Some(&[][..]));
    }

    #[test]
    fn try_lock_at_fails_on_uncached_partition() {
        let mut cache = PartitionStateCache::new();
        assert!(cache
            .try_lock_at("P1", &CheckpointTag::single_stream("s", 0), false)
            .is_none());
    }

    #[test]
    fn cache_and_lock_then_get_locked_roundtrips() {
        let mut cache = PartitionStateCache::new();
        let tag = CheckpointTag::single_stream("s", 0);

        cache.cache_and_lock("P1", b"state".to_vec(), tag.clone(), Some(tag.clone()));

        assert_eq!(cache.get_locked("P1"), Some(&b"state"[..]));
    }

    #[test]
    fn try_lock_at_conflicting_tag_is_rejected() {
        let mut cache = PartitionStateCache::new();
        let tag1 = CheckpointTag::single_stream("s", 0);
        let tag2 = CheckpointTag::single_stream("s", 1);

        cache.cache_and_lock("P1", b"state".to_vec(), tag1.clone(), Some(tag1.clone()));

        assert!(cache.try_lock_at("P1", &tag2, false).is_none());
    }

    #[test]
    fn try_lock_at_same_tag_allowed_with_relock_flag() {
        let mut cache = PartitionStateCache::new();
        let tag = CheckpointTag::single_stream("s", 0);

        cache.cache_and_lock("P1", b"state".to_vec(), tag.clone(), Some(tag.clone()));

        assert!(cache.try_lock_at("P1", &tag, false).is_none());
        assert_eq!(cache.try_lock_at("P1", &tag, true), Some(&b"state"[..]));
    }

    #[test]
    fn unlock_releases_locks_at_or_below_tag_but_never_root() {
        let mut cache = PartitionStateCache::new();
        let tag = CheckpointTag::single_stream("s", 0);

        cache.cache_and_lock("P1", b"state".to_vec(), tag.clone(), Some(tag.clone()));
        cache.unlock(&tag);

        assert_eq!(cache.get_locked("P1"), None);
        assert_eq!(cache.get_locked(ROOT_PARTITION), Some(&[][..]));

        // Unlocked entries remain re-lockable.
        assert_eq!(cache.try_lock_at("P1", &tag, false), Some(&b"state"[..]));
    }

    #[test]
    fn unlock_keeps_locks_held_above_tag() {
        let mut cache = PartitionStateCache::new();
        let tag1 = CheckpointTag::single_stream("s", 0);
        let tag2 = CheckpointTag::single_stream("s", 1);

        cache.cache_and_lock("P1", b"a".to_vec(), tag2.clone(), Some(tag2.clone()));
        cache.unlock(&tag1);

        assert_eq!(cache.get_locked("P1"), Some(&b"a"[..]));
    }
}
