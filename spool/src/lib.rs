//! Spool - priority job queue and lifecycle manager for generation jobs.
//!
//! Jobs move from submission through completion, retry or cancellation with
//! all coordination going through a relational store: there is no broker and
//! no lock shared between worker processes.
//!
//! # Core Concepts
//!
//! - **Job**: a unit of generation work with a typed, versioned
//!   [`JobConfiguration`]. Each job has one [`QueueEntry`] tracking its
//!   membership in the dequeue-ready set.
//!
//! - **Scheduling**: [`PriorityScheduler`] keeps a total order over queued
//!   entries (priority weight, then enqueue time) and hands each entry to at
//!   most one worker.
//!
//! - **Lifecycle**: the status state machine, processing deadlines and
//!   priority escalation live in [`lifecycle`]. [`RetryCoordinator`] moves
//!   failed jobs back into the queue within their retry budget.
//!
//! - **Batches**: [`BatchCoordinator`] submits many jobs under one batch id
//!   with partial success and derives the batch status from its members.
//!
//! - **Retention**: [`RetentionManager`] soft-deletes aged terminal jobs;
//!   preview and apply share one selection.
//!
//! - **Runtime**: [`QueueContext`] is the single entry point for the host
//!   application; [`QueueRuntime`] runs workers and the housekeeper on top
//!   of it.
//!
//! # Feature Flags
//!
//! - `postgres` (default) - PostgreSQL backend via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use spool::*;
//!
//! let bus = Arc::new(InProcEventBus::new(1024));
//! let context = QueueContextBuilder::<PostgresQueueService>::from_config(&SpoolConfig::default())
//!     .with_events(bus)
//!     .connect_postgres()
//!     .await?;
//!
//! let job = context.submit(owner_id, JobRequest::new(JobPriority::High, configuration)).await?;
//! let status = context.job_status(job.id, Some(owner_id)).await?;
//! ```

/// Batch submission and derived batch status.
pub mod batch;

/// Configuration structures for persistence, queue behaviour and retention.
pub mod config;

/// Error taxonomy shared by every component.
pub mod error;

/// Wait-time estimation from queue position and processing history.
pub mod estimate;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Core job, queue entry and identifier types.
pub mod job;

/// Status state machine, processing deadlines and priority escalation.
pub mod lifecycle;

#[cfg(feature = "metrics")]
/// Prometheus collectors for queue activity.
pub mod metrics;

/// Typed, versioned job configuration payloads.
pub mod payload;

#[cfg(feature = "postgres")]
/// PostgreSQL persistence implementation.
pub mod persistence;

/// Inbound requests and outbound responses.
pub mod request;

/// Soft deletion of aged terminal jobs and batch metadata.
pub mod retention;

/// Retry budget and requeue of failed jobs.
pub mod retry;

/// Queue context, workers and housekeeping.
pub mod runtime;

/// Total queue order, positions and dequeue.
pub mod scheduler;

/// Persistence contract for jobs and queue entries.
pub mod store;

/// Tracing spans and structured event recording.
pub mod telemetry;

pub use batch::*;
pub use config::*;
pub use error::{QueueError, Result};
pub use estimate::*;
pub use events::*;
pub use job::*;
pub use lifecycle::*;
pub use payload::*;
#[cfg(feature = "postgres")]
pub use persistence::{PostgresQueueService, MIGRATOR};
pub use request::*;
pub use retention::*;
pub use retry::*;
pub use runtime::*;
pub use scheduler::*;
pub use store::*;
