//! Error taxonomy shared by every queue component.

use thiserror::Error;

use crate::job::{JobId, JobStatus};

pub type Result<T> = std::result::Result<T, QueueError>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed request, rejected before anything is persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown (or not visible to the caller) job or batch.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The lifecycle state machine has no edge `from -> to`.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Store failure. Never retried inside the crate.
    #[error("persistence error: {0}")]
    Persistence(#[source] BoxError),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn job_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "job",
            id: id.to_string(),
        }
    }

    pub fn batch_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "batch",
            id: id.to_string(),
        }
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into().into())
    }

    /// Everything except a store failure can be handled by the caller
    /// without giving up on the operation as a whole.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, QueueError::Persistence(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::NotFound { .. })
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::Persistence(Box::new(err))
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Persistence(Box::new(err))
    }
}
