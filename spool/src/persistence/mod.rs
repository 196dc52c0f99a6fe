//! Relational backends.
//!
//! [`PostgresQueueService`] implements every service trait against the
//! `jobs`, `queue_entries` and `batch_metadata` tables created by
//! [`MIGRATOR`].
pub mod postgres;

pub use postgres::{PostgresQueueService, MIGRATOR};
