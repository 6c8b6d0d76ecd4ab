//! Core projection runtime for an event-sourced database.
//!
//! A *projection* is a deterministic fold over an ordered stream of committed
//! events into derived state, optionally emitting new events to derived
//! streams. This crate implements the runtime that drives that fold under
//! crash-recovery, guaranteeing at-most-one concurrent writer per derived
//! stream and monotonic progress under a checkpointing discipline.
//!
//! The runtime sits between three external collaborators, none of which this
//! crate implements:
//!
//! * an [`event_source::EventSource`] — an append-only, subscribable event log,
//! * a [`handler::ProjectionHandler`] — user-supplied fold logic,
//! * a persistence layer for checkpoints, which reuses the same
//!   [`event_source::EventSource`] trait against a dedicated stream.
//!
//! ## Component map
//!
//! ```text
//!   EventSource ──▶ Subscription ──▶ CoreProjection ──▶ ProjectionHandler
//!                                        │  ▲
//!                                        ▼  │
//!                              StagedQueue  PartitionStateCache
//!                                        │
//!                                        ▼
//!                              CheckpointManager ──▶ EmittedStream(s) ──▶ EventSource
//! ```
//!
//! [`tag::CheckpointTag`] is the totally-ordered position identifier threaded
//! through every component; [`projection::CoreProjection`] is the entry point
//! tying the rest together.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod emitted_stream;
pub mod error;
pub mod event_source;
pub mod events;
pub mod handler;
pub mod projection;
pub mod queue;
pub mod stats;
pub mod subscription;
pub mod tag;

#[cfg(feature = "tracing")]
pub mod instrumentation;

pub use error::FaultReason;
pub use event_source::EventSource;
pub use events::{EmittedEvent, Event, Metadata};
pub use handler::ProjectionHandler;
pub use projection::{CoreProjection, State as ProjectionState};
pub use tag::CheckpointTag;
