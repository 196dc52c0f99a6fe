use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{BatchId, ErrorInfo, JobId, JobPriority, JobStatus, JobType, OwnerId};

/// Envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    /// Shared by every event raised from the same operation, e.g. all
    /// submissions of one batch.
    pub correlation_id: Uuid,
    pub owner_id: Option<OwnerId>,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(owner_id: Option<OwnerId>, correlation_id: Option<Uuid>) -> Self {
        Self {
            version: 1,
            correlation_id: correlation_id.unwrap_or_else(Uuid::now_v7),
            owner_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(owner_id: Option<OwnerId>, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(owner_id, None),
            payload,
        }
    }

    pub fn correlated(
        owner_id: Option<OwnerId>,
        correlation_id: Uuid,
        payload: JobEventPayload,
    ) -> Self {
        Self {
            meta: EventMeta::new(owner_id, Some(correlation_id)),
            payload,
        }
    }

    /// Job the event is about, if it concerns a single job.
    pub fn job_id(&self) -> Option<JobId> {
        match &self.payload {
            JobEventPayload::Submitted { job_id, .. }
            | JobEventPayload::Dequeued { job_id, .. }
            | JobEventPayload::Progressed { job_id, .. }
            | JobEventPayload::Completed { job_id, .. }
            | JobEventPayload::Failed { job_id, .. }
            | JobEventPayload::RetriesExhausted { job_id, .. }
            | JobEventPayload::Cancelled { job_id }
            | JobEventPayload::Requeued { job_id, .. }
            | JobEventPayload::Escalated { job_id, .. } => Some(*job_id),
            JobEventPayload::SoftDeleted { .. } => None,
        }
    }
}

/// Lifecycle transitions observable from outside the queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    Submitted {
        job_id: JobId,
        job_type: JobType,
        priority: JobPriority,
        batch_id: Option<BatchId>,
    },
    Dequeued {
        job_id: JobId,
        worker_id: String,
        priority: JobPriority,
    },
    Progressed {
        job_id: JobId,
        progress: u8,
        stage: Option<String>,
    },
    Completed {
        job_id: JobId,
        job_type: JobType,
    },
    Failed {
        job_id: JobId,
        error: Option<ErrorInfo>,
        /// Whether a later retry sweep will requeue the job.
        retryable: bool,
    },
    /// The failure is final: the retry budget is spent.
    RetriesExhausted {
        job_id: JobId,
        retry_count: u32,
    },
    Cancelled {
        job_id: JobId,
    },
    Requeued {
        job_id: JobId,
        retry_count: u32,
    },
    Escalated {
        job_id: JobId,
        from: JobPriority,
        to: JobPriority,
    },
    /// A retention run soft-deleted jobs of one status.
    SoftDeleted {
        status: JobStatus,
        count: usize,
    },
}

/// Outbound event sink. Publishing failures never fail the queue operation
/// that raised the event.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;
}

/// Fan-out subscription to job events.
pub trait JobEventStream: Send + Sync {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus on a tokio broadcast channel.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and skips ahead.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events published while nobody is subscribed are dropped.
    pub fn publish_event(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl EventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.publish_event(event);
        Ok(())
    }
}

impl JobEventStream for InProcEventBus {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn submitted() -> JobEvent {
        JobEvent::new(
            Some(OwnerId::new()),
            JobEventPayload::Submitted {
                job_id: JobId::new(),
                job_type: JobType::VideoGeneration,
                priority: JobPriority::Normal,
                batch_id: None,
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe_jobs();
        let mut rx2 = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish(submitted()).await.unwrap();
        }

        for _ in 0..5 {
            assert!(timeout(Duration::from_millis(100), rx1.recv()).await.is_ok());
            assert!(timeout(Duration::from_millis(100), rx2.recv()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe_jobs();

        for _ in 0..5 {
            bus.publish(submitted()).await.unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(
            result,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = InProcEventBus::new(4);
        assert!(bus.publish(submitted()).await.is_ok());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_correlated_events_share_id() {
        let correlation = Uuid::now_v7();
        let a = JobEvent::correlated(None, correlation, JobEventPayload::Cancelled {
            job_id: JobId::new(),
        });
        let b = JobEvent::correlated(None, correlation, JobEventPayload::SoftDeleted {
            status: JobStatus::Completed,
            count: 3,
        });
        assert_eq!(a.meta.correlation_id, b.meta.correlation_id);
        assert!(a.job_id().is_some());
        assert!(b.job_id().is_none());
    }

    #[test]
    fn test_payload_serializes_with_event_tag() {
        let event = JobEventPayload::Escalated {
            job_id: JobId::new(),
            from: JobPriority::Low,
            to: JobPriority::Normal,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "escalated");
        assert_eq!(value["to"], "normal");
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::new(16);
        let _rx = bus.subscribe_jobs();
        let debug = format!("{bus:?}");
        assert!(debug.contains("capacity: 16"));
        assert!(debug.contains("subscribers: 1"));
    }
}
