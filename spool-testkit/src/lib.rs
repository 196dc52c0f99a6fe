//! Test support for spool: an in-memory backend with the same semantics as
//! the PostgreSQL one, request fixtures and recording doubles.

pub mod job;
pub mod mock;
pub mod queue;

pub use job::*;
pub use mock::*;
pub use queue::InMemoryQueue;

use std::sync::Arc;

use spool::{EventPublisher, QueueConfig, QueueContext, RetentionPolicy};

/// Context over a fresh in-memory backend, recording every event.
pub fn memory_context(
    config: QueueConfig,
) -> (QueueContext<InMemoryQueue>, InMemoryQueue, RecordingPublisher) {
    let backend = InMemoryQueue::with_config(config.clone());
    let events = RecordingPublisher::new();
    let publisher: Arc<dyn EventPublisher> = Arc::new(events.clone());
    let context = QueueContext::new(
        Arc::new(backend.clone()),
        publisher,
        config,
        RetentionPolicy::default(),
    );
    (context, backend, events)
}
