use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::{PersistenceConfig, QueueConfig, SpoolConfig};
use crate::events::EventPublisher;
use crate::retention::RetentionPolicy;

use super::context::{QueueBackend, QueueContext};

/// Builder for a [`QueueContext`] with explicit dependencies.
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use spool::*;
///
/// let bus = Arc::new(InProcEventBus::new(1024));
/// let context = QueueContextBuilder::from_config(&config)
///     .with_backend(Arc::new(backend))
///     .with_events(bus)
///     .build()?;
/// ```
pub struct QueueContextBuilder<B: QueueBackend> {
    config: QueueConfig,
    retention: RetentionPolicy,
    persistence: PersistenceConfig,
    backend: Option<Arc<B>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl<B: QueueBackend> fmt::Debug for QueueContextBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("QueueContextBuilder");
        debug.field("config", &self.config);
        debug.field("retention", &self.retention);
        debug.field("backend_set", &self.backend.is_some());
        debug.field("events_set", &self.events.is_some());
        if self.backend.is_some() {
            debug.field("backend_type", &type_name::<B>());
        }
        debug.finish()
    }
}

impl<B: QueueBackend> QueueContextBuilder<B> {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            retention: RetentionPolicy::default(),
            persistence: PersistenceConfig::default(),
            backend: None,
            events: None,
        }
    }

    pub fn from_config(config: &SpoolConfig) -> Self {
        Self {
            config: config.queue.clone(),
            retention: config.retention.clone(),
            persistence: config.persistence.clone(),
            backend: None,
            events: None,
        }
    }

    /// Connection settings used by `connect_postgres`.
    pub fn persistence(&self) -> &PersistenceConfig {
        &self.persistence
    }

    pub fn with_backend(mut self, backend: Arc<B>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// # Errors
    ///
    /// Returns an error if a dependency is missing or the queue configuration
    /// or retention policy is invalid.
    pub fn build(self) -> anyhow::Result<QueueContext<B>> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend dependency missing"))?;
        let events = self
            .events
            .ok_or_else(|| anyhow::anyhow!("events dependency missing"))?;
        self.config.validate()?;
        self.retention.validate()?;

        Ok(QueueContext::new(backend, events, self.config, self.retention))
    }
}

#[cfg(feature = "postgres")]
impl QueueContextBuilder<crate::persistence::PostgresQueueService> {
    /// Connect with the persistence settings, apply migrations and build.
    /// A backend set through `with_backend` is used as is.
    pub async fn connect_postgres(
        mut self,
    ) -> anyhow::Result<QueueContext<crate::persistence::PostgresQueueService>> {
        if self.backend.is_none() {
            let pool = self.persistence.connect().await?;
            let service =
                crate::persistence::PostgresQueueService::new(pool, self.config.clone());
            service.migrate().await?;
            tracing::info!("postgres queue backend ready");
            self.backend = Some(Arc::new(service));
        }
        self.build()
    }
}
