//! [`CoreProjection`]: the lifecycle state machine that ties every other
//! component in this crate together — the `StagedQueue`, the
//! `PartitionStateCache`, the `CheckpointManager`, and a dynamic set of
//! `EmittedStream`s — into one cooperative, single-task runtime driving one
//! user-supplied [`ProjectionHandler`].
//!
//! Per the "cyclic references" design note this crate follows, upward
//! signals (restart requests, stop completion) are never back-references:
//! they surface as `Result` values returned from the calls this type itself
//! makes into its children, handled in the one place, [`CoreProjection::run`],
//! that owns the whole cycle.

use std::collections::HashMap;

use futures::future::try_join_all;
use tokio::sync::{mpsc, oneshot};

use crate::cache::{PartitionStateCache, ROOT_PARTITION};
use crate::checkpoint::CheckpointManager;
use crate::config::ProjectionConfig;
use crate::emitted_stream::EmittedStream;
use crate::error::FaultReason;
use crate::event_source::EventSource;
use crate::events::{EmittedEvent, Event};
use crate::handler::{ProcessEventInput, ProjectionHandler};
use crate::queue::{Stage, StagedQueue, WorkItemKind};
use crate::stats::{DebugEvent, DebugEventBuffer, Statistics};
use crate::subscription::{SequencedMessage, Subscription, SubscriptionMessage};
use crate::tag::{CheckpointTag, PositionTagger};

/// Resolves the partition key an [`Event`] maps to — the StagedQueue's
/// stage-0 `resolve-partition` step. The empty string always denotes the
/// root partition, per [`crate::cache::ROOT_PARTITION`].
pub trait PartitionResolver: Send + Sync {
    fn resolve(&self, event: &Event) -> String;
}

/// A resolver for non-partitioned projections: every event maps to the root
/// partition.
#[derive(Debug, Clone, Copy, Default)]
pub struct RootPartitionResolver;

impl PartitionResolver for RootPartitionResolver {
    fn resolve(&self, _event: &Event) -> String {
        ROOT_PARTITION.to_owned()
    }
}

/// Lifecycle states a [`CoreProjection`] moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    LoadStateRequested,
    StateLoadedSubscribed,
    Running,
    Stopping,
    Stopped,
    FaultedStopping,
    Faulted,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Initial => "Initial",
            State::LoadStateRequested => "LoadStateRequested",
            State::StateLoadedSubscribed => "StateLoadedSubscribed",
            State::Running => "Running",
            State::Stopping => "Stopping",
            State::Stopped => "Stopped",
            State::FaultedStopping => "FaultedStopping",
            State::Faulted => "Faulted",
        }
    }
}

/// Management-surface requests a [`Handle`] can send a running
/// [`CoreProjection`]. `GetState`/`GetStats`/`GetDebugEvents` are the
/// out-of-order requests the specification calls out as bypassing the
/// `StagedQueue` entirely.
pub enum Command {
    Start,
    Stop,
    GetState {
        partition: String,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    GetStats {
        reply: oneshot::Sender<Statistics>,
    },
    GetDebugEvents {
        reply: oneshot::Sender<Vec<DebugEvent>>,
    },
}

/// A cheaply-cloneable handle for sending [`Command`]s to a running
/// [`CoreProjection`], obtained from [`CoreProjection::spawn`].
#[derive(Clone)]
pub struct Handle {
    tx: mpsc::Sender<Command>,
}

impl Handle {
    pub async fn start(&self) {
        let _ = self.tx.send(Command::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(Command::Stop).await;
    }

    pub async fn stats(&self) -> Option<Statistics> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::GetStats { reply }).await.ok()?;
        rx.await.ok()
    }

    pub async fn state(&self, partition: impl Into<String>) -> Option<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::GetState {
                partition: partition.into(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn debug_events(&self) -> Vec<DebugEvent> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::GetDebugEvents { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Scratch state carried between stages for one in-flight `ProcessEvent`
/// work item: the partition it resolved to at stage 0, and the handler's
/// output once stage 2 has run.
struct ItemContext {
    partition: String,
    output: Option<crate::handler::ProcessEventOutput>,
}

enum StageOutcome {
    Advance,
    Parked,
}

/// The lifecycle state machine owning one projection's `StagedQueue`,
/// `PartitionStateCache`, `CheckpointManager`, and `EmittedStream`s.
pub struct CoreProjection<S, H>
where
    S: EventSource + Clone + Send + Sync + 'static,
    H: ProjectionHandler + 'static,
{
    config: ProjectionConfig,
    source: S,
    handler: H,
    partition_resolver: Box<dyn PartitionResolver>,
    tagger: Box<dyn PositionTagger>,

    state: State,
    cache: PartitionStateCache,
    checkpoint_manager: CheckpointManager<S>,
    queue: StagedQueue,
    contexts: HashMap<u64, ItemContext>,
    emitted_streams: HashMap<String, EmittedStream<S>>,
    checkpoint_item_pending: bool,

    subscription_rx: Option<mpsc::Receiver<SequencedMessage>>,
    subscription_handle: Option<tokio::task::JoinHandle<()>>,
    expected_seq: u64,

    current_tag: CheckpointTag,
    events_processed: u64,
    last_checkpoint_tag: Option<CheckpointTag>,
    debug_events: DebugEventBuffer,
    fault_reason_text: Option<String>,
}

impl<S, H> CoreProjection<S, H>
where
    S: EventSource + Clone + Send + Sync + 'static,
    H: ProjectionHandler + 'static,
{
    /// Creates a new, unstarted projection for a non-partitioned handler.
    pub fn new(config: ProjectionConfig, source: S, handler: H, tagger: Box<dyn PositionTagger>) -> Self {
        Self::with_partition_resolver(config, source, handler, tagger, Box::new(RootPartitionResolver))
    }

    /// Creates a new, unstarted projection with an explicit
    /// [`PartitionResolver`], for handlers that fan state out across more
    /// than the root partition.
    pub fn with_partition_resolver(
        config: ProjectionConfig,
        source: S,
        handler: H,
        tagger: Box<dyn PositionTagger>,
        partition_resolver: Box<dyn PartitionResolver>,
    ) -> Self {
        let checkpoint_manager = if config.partitioned {
            CheckpointManager::partitioned(source.clone(), config.name.clone())
        } else {
            CheckpointManager::new(source.clone(), config.name.clone())
        };

        let debug_events = DebugEventBuffer::new(config.debug_event_buffer_size);
        let pending_events_threshold = config.pending_events_threshold;

        Self {
            config,
            source,
            handler,
            partition_resolver,
            tagger,
            state: State::Initial,
            cache: PartitionStateCache::new(),
            checkpoint_manager,
            queue: StagedQueue::new(pending_events_threshold),
            contexts: HashMap::new(),
            emitted_streams: HashMap::new(),
            checkpoint_item_pending: false,
            subscription_rx: None,
            subscription_handle: None,
            expected_seq: 0,
            current_tag: CheckpointTag::Zero,
            events_processed: 0,
            last_checkpoint_tag: None,
            debug_events,
            fault_reason_text: None,
        }
    }

    /// Spawns this projection onto its own `tokio::task`, returning a
    /// [`Handle`] for sending it management commands and the `JoinHandle`
    /// for awaiting its terminal result.
    pub fn spawn(self) -> (tokio::task::JoinHandle<Result<(), FaultReason>>, Handle) {
        let (tx, rx) = mpsc::channel(32);
        let handle = Handle { tx };
        let join = tokio::spawn(self.run(rx));
        (join, handle)
    }

    /// Drives this projection to completion: repeatedly (re-)loads its
    /// checkpoint, subscribes, and processes input until the `commands`
    /// channel is dropped (graceful exit) or an unrecoverable error faults
    /// the projection.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<(), FaultReason> {
        loop {
            self.state = State::Initial;

            match self.cycle(&mut commands).await {
                Ok(()) => return Ok(()),
                // A foreign writer on an owned stream is recoverable: tear
                // down and re-enter the cycle, reloading the checkpoint and
                // re-subscribing against the store's now-authoritative state.
                Err(FaultReason::ConcurrencyConflict(msg)) => {
                    log_restart(&self.config.name, &msg);
                    continue;
                }
                Err(reason) => {
                    self.transition(State::FaultedStopping);
                    // Best-effort: persist whatever checkpoint is parked so a
                    // future restart loses as little progress as possible.
                    let _ = self.checkpoint_manager.try_write(true).await;
                    self.state = State::Faulted;
                    self.fault_reason_text = Some(reason.to_string());
                    log_fault(&self.config.name, &reason);
                    return Err(reason);
                }
            }
        }
    }

    /// Runs one load→subscribe→drive cycle to completion. Returns `Ok(())`
    /// once the `commands` channel closes (graceful shutdown); returns `Err`
    /// on any fault, including [`FaultReason::ConcurrencyConflict`], which
    /// [`Self::run`] alone decides how to handle.
    async fn cycle(&mut self, commands: &mut mpsc::Receiver<Command>) -> Result<(), FaultReason> {
        self.transition(State::LoadStateRequested);
        self.load_and_subscribe().await?;

        self.transition(if self.config.start_on_load {
            State::Running
        } else {
            State::Stopped
        });

        loop {
            let mut subscription_rx = self.subscription_rx.take().expect("subscribed in load_and_subscribe");

            let exit = if self.state == State::Stopped {
                tokio::select! {
                    cmd = commands.recv() => self.handle_command(cmd, &mut subscription_rx).await,
                }
            } else {
                tokio::select! {
                    msg = subscription_rx.recv() => self.handle_subscription_message(msg).await,
                    cmd = commands.recv() => self.handle_command(cmd, &mut subscription_rx).await,
                }
            };

            self.subscription_rx = Some(subscription_rx);

            if exit? {
                return Ok(());
            }
        }
    }

    async fn load_and_subscribe(&mut self) -> Result<(), FaultReason> {
        if let Some(handle) = self.subscription_handle.take() {
            handle.abort();
        }

        let loaded = self.checkpoint_manager.load().await?;

        self.cache = PartitionStateCache::new();
        if loaded.tag != CheckpointTag::Zero {
            self.cache
                .cache_and_lock(ROOT_PARTITION, loaded.state.clone(), loaded.tag.clone(), Some(loaded.tag.clone()));
        }

        self.handler
            .initialize()
            .await
            .map_err(|e| handler_exception(&loaded.tag, e))?;
        self.handler
            .load(&loaded.state)
            .await
            .map_err(|e| handler_exception(&loaded.tag, e))?;

        self.current_tag = loaded.tag.clone();
        self.last_checkpoint_tag = if loaded.tag == CheckpointTag::Zero {
            None
        } else {
            Some(loaded.tag.clone())
        };
        self.expected_seq = 0;
        self.queue = StagedQueue::new(self.config.pending_events_threshold);
        self.contexts.clear();
        self.emitted_streams.clear();
        self.checkpoint_item_pending = false;

        let from_global_position = match &loaded.tag {
            CheckpointTag::Prepared { commit, .. } => *commit,
            _ => 0,
        };

        let subscription = Subscription::new(self.source.clone(), self.tagger.clone_box(), loaded.tag, from_global_position)
            .with_event_filter(self.config.event_filter.clone())
            .with_checkpoint_unhandled_bytes_threshold(self.config.checkpoint_unhandled_bytes_threshold)
            .with_stop_on_eof(self.config.stop_on_eof);

        let (tx, rx) = mpsc::channel(self.config.pending_events_threshold.max(16));
        self.subscription_handle = Some(tokio::spawn(subscription.run(tx)));
        self.subscription_rx = Some(rx);

        self.transition(State::StateLoadedSubscribed);

        Ok(())
    }

    /// Handles one [`Command`]. Returns `true` if the command channel has
    /// closed and the owning cycle should exit.
    async fn handle_command(
        &mut self,
        cmd: Option<Command>,
        subscription_rx: &mut mpsc::Receiver<SequencedMessage>,
    ) -> Result<bool, FaultReason> {
        let Some(cmd) = cmd else {
            return Ok(true);
        };

        match cmd {
            Command::Start => {
                if self.state == State::Stopped {
                    self.transition(State::Running);
                } else {
                    return Err(FaultReason::InvariantViolation(
                        "Stream is already started".to_owned(),
                    ));
                }
            }
            Command::Stop => {
                if self.state == State::Running {
                    self.transition(State::Stopping);
                    self.suggest_checkpoint(self.current_tag.clone());
                    self.drain_queue().await?;
                    if self.is_quiesced() {
                        self.transition(State::Stopped);
                    }
                }
            }
            Command::GetState { partition, reply } => {
                let _ = reply.send(self.cache.get_locked(&partition).map(<[u8]>::to_vec));
            }
            Command::GetStats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::GetDebugEvents { reply } => {
                let _ = reply.send(self.debug_events.snapshot());
            }
        }

        let _ = subscription_rx;
        Ok(false)
    }

    /// Handles one [`SequencedMessage`] from the subscription. Always
    /// returns `false`: a closed subscription channel does not by itself end
    /// the cycle — only the command channel closing does.
    async fn handle_subscription_message(
        &mut self,
        msg: Option<SequencedMessage>,
    ) -> Result<bool, FaultReason> {
        let Some(msg) = msg else {
            // The subscription task ended without an explicit EofReached
            // (e.g. the source closed); nothing further can arrive.
            return Ok(false);
        };

        if msg.seq != self.expected_seq + 1 {
            return Err(FaultReason::InvariantViolation(format!(
                "out-of-order subscription message: expected seq {}, got {}",
                self.expected_seq + 1,
                msg.seq
            )));
        }
        self.expected_seq = msg.seq;

        match msg.message {
            SubscriptionMessage::EventReceived(event, tag) => {
                self.current_tag = tag.clone();
                self.queue.enqueue(WorkItemKind::ProcessEvent { event, tag });
                self.drain_queue().await?;
            }
            SubscriptionMessage::ProgressChanged(progress) => {
                self.queue.enqueue(WorkItemKind::ProgressUpdate { progress });
                self.drain_queue().await?;
            }
            SubscriptionMessage::CheckpointSuggested(tag) => {
                self.current_tag = tag.clone();
                self.suggest_checkpoint(tag);
                self.drain_queue().await?;
            }
            SubscriptionMessage::EofReached => {
                if self.config.stop_on_eof && self.state == State::Running {
                    self.transition(State::Stopping);
                    self.suggest_checkpoint(self.current_tag.clone());
                    self.drain_queue().await?;
                    if self.is_quiesced() {
                        self.transition(State::Stopped);
                    }
                }
            }
        }

        if self.state == State::Stopping && self.is_quiesced() {
            self.transition(State::Stopped);
        }

        Ok(false)
    }

    fn suggest_checkpoint(&mut self, tag: CheckpointTag) {
        let root_state = self.cache.get_locked(ROOT_PARTITION).map(<[u8]>::to_vec).unwrap_or_default();
        self.checkpoint_manager.suggest(tag.clone(), root_state);

        if !self.checkpoint_item_pending {
            self.queue.enqueue(WorkItemKind::EmitCheckpoint { tag });
            self.checkpoint_item_pending = true;
        }
    }

    fn is_quiesced(&self) -> bool {
        self.queue.pending_len() == 0
            && self.emitted_streams.values().all(EmittedStream::is_idle)
            && self.checkpoint_manager.suggested_tag().is_none()
    }

    /// Drains as much of the `StagedQueue` as can currently make progress:
    /// advances every ready item one stage, draining pending emitted-stream
    /// writes between rounds so a parked checkpoint's readiness stays fresh.
    async fn drain_queue(&mut self) -> Result<(), FaultReason> {
        loop {
            self.drain_emitted_streams().await?;

            let ready = self.queue.ready_items();
            if ready.is_empty() {
                break;
            }

            let mut any_advanced = false;

            for (id, stage) in ready {
                self.queue.mark_in_flight(id);

                match self.run_stage(id, stage).await? {
                    StageOutcome::Advance => {
                        if let Some(completed) = self.queue.advance(id) {
                            self.finalize(completed);
                        }
                        any_advanced = true;
                    }
                    StageOutcome::Parked => {
                        self.queue.retry(id);
                    }
                }
            }

            if !any_advanced {
                break;
            }
        }

        Ok(())
    }

    /// Drains every `EmittedStream` concurrently rather than one at a time:
    /// each stream's recovery read or append is independent I/O against a
    /// distinct target stream, so there is no reason a slow one should block
    /// the rest from making progress within one drain pass.
    async fn drain_emitted_streams(&mut self) -> Result<(), FaultReason> {
        try_join_all(
            self.emitted_streams
                .values_mut()
                .map(|stream| async move { stream.drain().await.map_err(FaultReason::from) }),
        )
        .await?;
        Ok(())
    }

    async fn run_stage(&mut self, id: u64, stage: Stage) -> Result<StageOutcome, FaultReason> {
        let kind = self
            .queue
            .kind(id)
            .cloned()
            .ok_or_else(|| FaultReason::InvariantViolation(format!("work item {id} missing from queue")))?;

        match (kind, stage) {
            (WorkItemKind::ProcessEvent { event, .. }, Stage::ResolvePartition) => {
                let partition = self.partition_resolver.resolve(&event);
                self.contexts.insert(id, ItemContext { partition, output: None });
            }
            (WorkItemKind::ProcessEvent { tag, .. }, Stage::LoadState) => {
                let partition = self
                    .contexts
                    .get(&id)
                    .map(|ctx| ctx.partition.clone())
                    .ok_or_else(|| FaultReason::InvariantViolation("load-state before resolve-partition".into()))?;
                self.ensure_partition_loaded(&partition, &tag).await?;
            }
            (WorkItemKind::ProcessEvent { event, tag }, Stage::ProcessEvent) => {
                let partition = self
                    .contexts
                    .get(&id)
                    .map(|ctx| ctx.partition.clone())
                    .ok_or_else(|| FaultReason::InvariantViolation("process before load-state".into()))?;

                let state = self
                    .cache
                    .get_locked(&partition)
                    .ok_or_else(|| FaultReason::InvariantViolation(format!("partition {partition:?} not locked for processing")))?
                    .to_vec();

                self.handler.load(&state).await.map_err(|e| handler_exception(&tag, e))?;

                let category = event.stream_id.split('-').next().unwrap_or("").to_owned();
                let input = ProcessEventInput {
                    partition: &partition,
                    tag: &tag,
                    stream_id: &event.stream_id,
                    event_type: &event.event_type,
                    category: &category,
                    event_id: event.event_id,
                    event_number: event.event_number,
                    metadata: &event.metadata,
                    data: &event.data,
                };

                let output = self
                    .handler
                    .process_event(input)
                    .await
                    .map_err(|e| handler_exception(&tag, e))?;

                self.debug_events.push(DebugEvent {
                    partition: partition.clone(),
                    tag: tag.clone(),
                    stream_id: event.stream_id.clone(),
                    event_type: event.event_type.clone(),
                    handled: output.handled,
                });

                if output.handled {
                    self.cache
                        .cache_and_lock(partition.clone(), output.new_state.clone(), tag.clone(), Some(tag.clone()));
                }

                if let Some(ctx) = self.contexts.get_mut(&id) {
                    ctx.output = Some(output);
                }
            }
            (WorkItemKind::ProcessEvent { tag, .. }, Stage::WriteOutput) => {
                let ctx = self
                    .contexts
                    .remove(&id)
                    .ok_or_else(|| FaultReason::InvariantViolation("write-output before process-event".into()))?;

                if let Some(output) = ctx.output {
                    if output.handled && self.config.partitioned {
                        self.checkpoint_manager
                            .record_partition_state(ctx.partition.clone(), tag.clone(), output.new_state.clone());
                    }

                    for emitted in output.emitted {
                        self.emit(emitted)?;
                    }
                }

                self.events_processed += 1;
            }
            (WorkItemKind::EmitCheckpoint { .. }, Stage::WriteOutput) => {
                if self.checkpoint_manager.suggested_tag().is_none() {
                    // Already written via an earlier coalesced suggestion.
                    self.checkpoint_item_pending = false;
                    return Ok(StageOutcome::Advance);
                }

                let ready = self.emitted_streams.values().all(EmittedStream::is_idle);

                if !ready {
                    return Ok(StageOutcome::Parked);
                }

                if let Some(committed_tag) = self.checkpoint_manager.try_write(true).await? {
                    self.cache.unlock(&committed_tag);
                    self.last_checkpoint_tag = Some(committed_tag.clone());
                    self.checkpoint_item_pending = false;
                    tracing_checkpoint_completed(&self.config.name, &committed_tag);
                }
            }
            (WorkItemKind::EmitCheckpoint { .. }, _) | (WorkItemKind::ProgressUpdate { .. }, _) => {}
        }

        Ok(StageOutcome::Advance)
    }

    async fn ensure_partition_loaded(&mut self, partition: &str, tag: &CheckpointTag) -> Result<(), FaultReason> {
        if self.cache.get_locked(partition).is_some() {
            return Ok(());
        }

        if self.cache.try_lock_at(partition, tag, true).is_some() {
            return Ok(());
        }

        if partition == ROOT_PARTITION {
            self.cache.cache_and_lock(partition.to_owned(), Vec::new(), tag.clone(), Some(tag.clone()));
            return Ok(());
        }

        let state = if self.config.partitioned {
            let stream = crate::checkpoint::partition_state_stream_name(&self.config.name, partition);
            let slice = self
                .source
                .read_stream_backward(&stream, -1, 1)
                .await
                .map_err(|e| FaultReason::UnsupportedResult(e.to_string()))?;
            slice.events.first().map(|event| event.data.clone()).unwrap_or_default()
        } else {
            Vec::new()
        };

        self.cache.cache_and_lock(partition.to_owned(), state, tag.clone(), Some(tag.clone()));
        Ok(())
    }

    fn emit(&mut self, emitted: EmittedEvent) -> Result<(), FaultReason> {
        let target = emitted.target_stream.clone();
        let max_batch = self.config.max_write_batch_length;
        let source = self.source.clone();

        let stream = self
            .emitted_streams
            .entry(target.clone())
            .or_insert_with(|| EmittedStream::new(source, target).with_max_write_batch_length(max_batch));

        stream.submit(emitted)?;
        Ok(())
    }

    fn finalize(&mut self, _completed: WorkItemKind) {}

    fn transition(&mut self, to: State) {
        if self.state != to {
            log_transition(&self.config.name, self.state.name(), to.name());
        }
        self.state = to;
    }

    fn stats(&self) -> Statistics {
        Statistics {
            state: self.state.name().to_owned(),
            events_processed: self.events_processed,
            pending_events: self.queue.pending_len(),
            last_checkpoint_tag: self.last_checkpoint_tag.clone(),
            write_queues_length: self.emitted_streams.values().filter(|s| !s.is_idle()).count(),
            faulted_reason: self.fault_reason_text.clone(),
        }
    }
}

impl<S, H> Drop for CoreProjection<S, H>
where
    S: EventSource + Clone + Send + Sync + 'static,
    H: ProjectionHandler + 'static,
{
    fn drop(&mut self) {
        if let Some(handle) = self.subscription_handle.take() {
            handle.abort();
        }
    }
}

fn handler_exception<E: std::error::Error + Send + Sync + 'static>(tag: &CheckpointTag, err: E) -> FaultReason {
    FaultReason::HandlerException {
        tag: tag.clone(),
        source: anyhow::Error::from(err),
    }
}

#[cfg(feature = "tracing")]
fn log_transition(projection_name: &str, from: &str, to: &str) {
    crate::instrumentation::log_transition(projection_name, from, to, None);
}

#[cfg(not(feature = "tracing"))]
fn log_transition(_projection_name: &str, _from: &str, _to: &str) {}

#[cfg(feature = "tracing")]
fn log_fault(projection_name: &str, reason: &FaultReason) {
    tracing::error!(projection = projection_name, %reason, "projection faulted");
}

#[cfg(not(feature = "tracing"))]
fn log_fault(_projection_name: &str, _reason: &FaultReason) {}

#[cfg(feature = "tracing")]
fn log_restart(projection_name: &str, reason: &str) {
    crate::instrumentation::log_transition(projection_name, "Running", "Initial", Some(reason));
}

#[cfg(not(feature = "tracing"))]
fn log_restart(_projection_name: &str, _reason: &str) {}

#[cfg(feature = "tracing")]
fn tracing_checkpoint_completed(projection_name: &str, tag: &CheckpointTag) {
    tracing::debug!(projection = projection_name, ?tag, "checkpoint completed");
}

#[cfg(not(feature = "tracing"))]
fn tracing_checkpoint_completed(_projection_name: &str, _tag: &CheckpointTag) {}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::config::ProjectionConfig;
    use crate::event_source::{ExpectedVersion, InMemory, NewEvent};
    use crate::handler::{ProcessEventInput, ProcessEventOutput, ProjectionHandler};
    use crate::tag::SingleStreamTagger;

    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("handler error: {0}")]
    struct TestHandlerError(String);

    /// A handler that appends every event's payload to its state string.
    struct ConcatHandler {
        state: String,
    }

    impl ConcatHandler {
        fn new() -> Self {
            Self { state: String::new() }
        }
    }

    #[async_trait::async_trait]
    impl ProjectionHandler for ConcatHandler {
        type Error = TestHandlerError;

        async fn load(&mut self, state: &[u8]) -> Result<(), Self::Error> {
            self.state = String::from_utf8_lossy(state).into_owned();
            Ok(())
        }

        async fn process_event(
            &mut self,
            input: ProcessEventInput<'_>,
        ) -> Result<ProcessEventOutput, Self::Error> {
            self.state.push_str(&String::from_utf8_lossy(input.data));
            Ok(ProcessEventOutput {
                new_state: self.state.clone().into_bytes(),
                emitted: vec![],
                handled: true,
            })
        }
    }

    /// A handler that emits one event per input to a fixed target stream.
    struct EmittingHandler {
        target: String,
    }

    #[async_trait::async_trait]
    impl ProjectionHandler for EmittingHandler {
        type Error = TestHandlerError;

        async fn load(&mut self, _state: &[u8]) -> Result<(), Self::Error> {
            Ok(())
        }

        async fn process_event(
            &mut self,
            input: ProcessEventInput<'_>,
        ) -> Result<ProcessEventOutput, Self::Error> {
            let emitted = EmittedEvent::new(self.target.clone(), "Out", input.data.to_vec(), input.tag.clone());
            Ok(ProcessEventOutput {
                new_state: vec![],
                emitted: vec![emitted],
                handled: true,
            })
        }
    }

    fn event(event_type: &str, data: &str) -> NewEvent {
        NewEvent::new(event_type, data.as_bytes().to_vec())
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn start_from_empty_folds_events_without_checkpointing() {
        let source = InMemory::default();
        source
            .append(
                "foo",
                ExpectedVersion::Any,
                vec![event("T", "A"), event("T", "B"), event("T", "C")],
            )
            .await
            .unwrap();

        let config = ProjectionConfig::new("concat").with_checkpoint_unhandled_bytes_threshold(1_000_000);
        let projection = CoreProjection::new(config, source, ConcatHandler::new(), Box::new(SingleStreamTagger));

        let (join, handle) = projection.spawn();
        settle().await;

        let state = handle.state("").await;
        assert_eq!(state, Some(b"ABC".to_vec()));

        handle.stop().await;
        settle().await;
        drop(handle);

        let _ = tokio::time::timeout(Duration::from_millis(200), join).await;
    }

    #[tokio::test]
    async fn checkpoint_written_after_threshold_crossed_between_emits() {
        let source = InMemory::default();
        source
            .append(
                "foo",
                ExpectedVersion::Any,
                vec![event("T", "A"), event("T", "B"), event("T", "C")],
            )
            .await
            .unwrap();

        let config = ProjectionConfig::new("emitter").with_checkpoint_unhandled_bytes_threshold(2);
        let projection = CoreProjection::new(
            config,
            source.clone(),
            EmittingHandler { target: "$out".into() },
            Box::new(SingleStreamTagger),
        );

        let (_join, handle) = projection.spawn();
        settle().await;

        let checkpoint_stream = crate::checkpoint::checkpoint_stream_name("emitter");
        let slice = source.read_stream_backward(&checkpoint_stream, -1, 10).await.unwrap();
        assert_eq!(slice.events.len(), 1);

        let out_slice = source.read_stream_backward("$out", -1, 10).await.unwrap();
        assert_eq!(out_slice.events.len(), 3);
    }

    #[tokio::test]
    async fn double_start_is_an_invariant_violation() {
        let source = InMemory::default();
        let config = ProjectionConfig::new("double-start").with_start_on_load(false);
        let projection = CoreProjection::new(config, source, ConcatHandler::new(), Box::new(SingleStreamTagger));

        let (join, handle) = projection.spawn();
        settle().await;

        handle.start().await;
        settle().await;

        handle.start().await;
        settle().await;

        let result = tokio::time::timeout(Duration::from_millis(200), join).await.unwrap().unwrap();
        assert!(matches!(result, Err(FaultReason::InvariantViolation(ref msg)) if msg.contains("already started")));
    }

    #[tokio::test]
    async fn zero_events_stop_checkpoints_exactly_once_with_no_emits() {
        let source = InMemory::default();
        let config = ProjectionConfig::new("idle");
        let projection = CoreProjection::new(config, source.clone(), ConcatHandler::new(), Box::new(SingleStreamTagger));

        let (_join, handle) = projection.spawn();
        settle().await;

        handle.stop().await;
        settle().await;

        let checkpoint_stream = crate::checkpoint::checkpoint_stream_name("idle");
        let slice = source.read_stream_backward(&checkpoint_stream, -1, 10).await.unwrap();
        assert_eq!(slice.events.len(), 1);
    }

    #[tokio::test]
    async fn partitioned_projection_caches_state_per_partition() {
        let source = InMemory::default();
        source
            .append(
                "foo",
                ExpectedVersion::Any,
                vec![event("T", "1"), event("T", "2")],
            )
            .await
            .unwrap();
        source
            .append(
                "bar",
                ExpectedVersion::Any,
                vec![event("T", "9")],
            )
            .await
            .unwrap();

        struct ByStreamHandler;

        #[async_trait::async_trait]
        impl ProjectionHandler for ByStreamHandler {
            type Error = TestHandlerError;

            async fn load(&mut self, _state: &[u8]) -> Result<(), Self::Error> {
                Ok(())
            }

            async fn process_event(
                &mut self,
                input: ProcessEventInput<'_>,
            ) -> Result<ProcessEventOutput, Self::Error> {
                Ok(ProcessEventOutput {
                    new_state: input.data.to_vec(),
                    emitted: vec![],
                    handled: true,
                })
            }
        }

        struct ByStream;
        impl PartitionResolver for ByStream {
            fn resolve(&self, event: &Event) -> String {
                event.stream_id.clone()
            }
        }

        let config = ProjectionConfig::new("partitioned").partitioned();
        let projection = CoreProjection::with_partition_resolver(
            config,
            source,
            ByStreamHandler,
            Box::new(crate::tag::MultiStreamTagger),
            Box::new(ByStream),
        );

        let (_join, handle) = projection.spawn();
        settle().await;

        assert_eq!(handle.state("foo").await, Some(b"2".to_vec()));
        assert_eq!(handle.state("bar").await, Some(b"9".to_vec()));
    }
}
