//! [`StagedQueue`]: an ordered, multi-stage pipeline that processes each
//! work item through four fixed stages while preserving checkpoint-tag
//! order across items. Out-of-order requests (state reads for the
//! management surface) bypass this queue entirely — they read
//! [`crate::cache::PartitionStateCache`] directly and never appear here.

use std::collections::VecDeque;

use crate::events::Event;
use crate::tag::CheckpointTag;

/// One of the four fixed stages every work item passes through, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    ResolvePartition,
    LoadState,
    ProcessEvent,
    WriteOutput,
}

impl Stage {
    fn next(self) -> Option<Stage> {
        match self {
            Stage::ResolvePartition => Some(Stage::LoadState),
            Stage::LoadState => Some(Stage::ProcessEvent),
            Stage::ProcessEvent => Some(Stage::WriteOutput),
            Stage::WriteOutput => None,
        }
    }
}

/// A unit of work moving through the [`StagedQueue`]. `GetState` requests
/// are deliberately not a variant here — they bypass the queue.
#[derive(Debug, Clone)]
pub enum WorkItemKind {
    /// A subscription-delivered event awaiting the four-stage fold.
    ProcessEvent { event: Event, tag: CheckpointTag },
    /// A parked checkpoint suggestion, re-evaluated once write stages drain.
    EmitCheckpoint { tag: CheckpointTag },
    /// A catch-up progress update, forwarded without touching cache state.
    ProgressUpdate { progress: f32 },
}

struct WorkItem {
    id: u64,
    kind: WorkItemKind,
    stage: Stage,
    in_flight: bool,
}

/// Processes work items through {resolve-partition, load-state,
/// process-event, write-output}, guaranteeing that stage N of item I+1 never
/// begins before stage N of item I has completed, while still letting
/// different items occupy different stages concurrently.
pub struct StagedQueue {
    items: VecDeque<WorkItem>,
    next_id: u64,
    pending_events_threshold: usize,
}

impl StagedQueue {
    /// Creates an empty queue. `pending_events_threshold` is the backpressure
    /// limit the owning `Subscription` checks via [`Self::is_over_threshold`].
    pub fn new(pending_events_threshold: usize) -> Self {
        Self {
            items: VecDeque::new(),
            next_id: 0,
            pending_events_threshold,
        }
    }

    /// Enqueues a new work item at stage 0, returning its id.
    pub fn enqueue(&mut self, kind: WorkItemKind) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.items.push_back(WorkItem {
            id,
            kind,
            stage: Stage::ResolvePartition,
            in_flight: false,
        });

        id
    }

    /// Returns every item currently eligible to begin its current stage:
    /// not already dispatched, and not blocked by the item ahead of it still
    /// occupying (or not yet past) that same stage.
    pub fn ready_items(&self) -> Vec<(u64, Stage)> {
        let mut ready = Vec::new();
        let mut prev_stage: Option<Stage> = None;

        for item in &self.items {
            let blocked_by_predecessor = matches!(prev_stage, Some(prev) if prev <= item.stage);

            if !item.in_flight && !blocked_by_predecessor {
                ready.push((item.id, item.stage));
            }

            prev_stage = Some(item.stage);
        }

        ready
    }

    /// Returns a reference to `id`'s work item kind, if still queued.
    pub fn kind(&self, id: u64) -> Option<&WorkItemKind> {
        self.items.iter().find(|item| item.id == id).map(|item| &item.kind)
    }

    /// Marks `id` as dispatched for its current stage, excluding it from
    /// [`Self::ready_items`] until [`Self::advance`] is called for it.
    pub fn mark_in_flight(&mut self, id: u64) {
        if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
            item.in_flight = true;
        }
    }

    /// Clears `id`'s in-flight flag without advancing its stage, making it
    /// eligible for [`Self::ready_items`] again. Used when a stage's
    /// precondition (e.g. a checkpoint gated on emit drain) isn't yet met and
    /// the item must be retried rather than advanced.
    pub fn retry(&mut self, id: u64) {
        if let Some(item) = self.items.iter_mut().find(|item| item.id == id) {
            item.in_flight = false;
        }
    }

    /// Advances `id` past its current stage. If it was at `WriteOutput`, the
    /// item is complete and removed from the queue (always from the front,
    /// since completion order follows enqueue order by construction).
    /// Returns the completed item's kind, if it completed.
    pub fn advance(&mut self, id: u64) -> Option<WorkItemKind> {
        let pos = self.items.iter().position(|item| item.id == id)?;

        match self.items[pos].stage.next() {
            Some(next_stage) => {
                self.items[pos].stage = next_stage;
                self.items[pos].in_flight = false;
                None
            }
            None => {
                debug_assert_eq!(pos, 0, "completion must happen in enqueue order");
                self.items.pop_front().map(|item| item.kind)
            }
        }
    }

    /// Number of items currently queued, used for backpressure reporting.
    pub fn pending_len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue has grown past its configured backpressure
    /// threshold; the `Subscription`'s reader should pause until this clears.
    pub fn is_over_threshold(&self) -> bool {
        self.items.len() >= self.pending_events_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint_suggested(tag: i64) -> WorkItemKind {
        WorkItemKind::EmitCheckpoint {
            tag: CheckpointTag::all(tag, tag),
        }
    }

    #[test]
    fn single_item_starts_at_resolve_partition() {
        let mut queue = StagedQueue::new(100);
        let id = queue.enqueue(checkpoint_suggested(1));

        assert_eq!(queue.ready_items(), vec![(id, Stage::ResolvePartition)]);
    }

    #[test]
    fn second_item_cannot_begin_same_stage_as_first() {
        let mut queue = StagedQueue::new(100);
        let id1 = queue.enqueue(checkpoint_suggested(1));
        let _id2 = queue.enqueue(checkpoint_suggested(2));

        // Only the head item is ready; the second is blocked at stage 0
        // until the first moves past stage 0.
        assert_eq!(queue.ready_items(), vec![(id1, Stage::ResolvePartition)]);
    }

    #[test]
    fn items_pipeline_once_head_advances() {
        let mut queue = StagedQueue::new(100);
        let id1 = queue.enqueue(checkpoint_suggested(1));
        let id2 = queue.enqueue(checkpoint_suggested(2));

        queue.mark_in_flight(id1);
        queue.advance(id1);

        let ready = queue.ready_items();
        assert_eq!(ready, vec![(id1, Stage::LoadState), (id2, Stage::ResolvePartition)]);
    }

    #[test]
    fn completion_removes_item_in_enqueue_order() {
        let mut queue = StagedQueue::new(100);
        let id1 = queue.enqueue(checkpoint_suggested(1));

        for _ in 0..4 {
            queue.mark_in_flight(id1);
            queue.advance(id1);
        }

        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn threshold_reports_backpressure() {
        let mut queue = StagedQueue::new(2);
        queue.enqueue(checkpoint_suggested(1));
        assert!(!queue.is_over_threshold());

        queue.enqueue(checkpoint_suggested(2));
        assert!(queue.is_over_threshold());
    }
}
