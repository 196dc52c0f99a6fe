/// Builder for constructing queue contexts.
pub mod builder;
/// The host-facing queue context and the backend bound it drives.
pub mod context;
/// Worker pool, housekeeper and graceful shutdown.
pub mod supervisor;
/// Worker configuration, job handlers and the worker loop.
pub mod worker;

pub use builder::QueueContextBuilder;
pub use context::{FailureOutcome, MaintenanceReport, QueueBackend, QueueContext};
pub use supervisor::{QueueRuntime, ShutdownToken};
pub use worker::{HandlerOutcome, JobHandler, ProgressReporter, WorkerConfig};
