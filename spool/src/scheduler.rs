use std::cmp::Ordering;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::job::{ClaimedJob, JobId, JobPriority};

/// Total queue order and at-most-once dequeue.
#[async_trait]
pub trait PriorityScheduler: Send + Sync {
    /// Rebuild `queue_position` for every queued entry from scratch.
    ///
    /// Positions are a contiguous 1-based rank under (priority weight desc,
    /// queued_at asc, job id asc); entries that are not queued have no
    /// position. The rebuild is a full O(N log N) pass on every call: there
    /// is no incremental maintenance, which keeps the operation idempotent
    /// and self-healing. Concurrent runs must be serialized by the
    /// implementation. Returns the number of ranked entries.
    async fn recalculate_positions(&self) -> Result<u64>;

    /// Claim the highest-ranked queued entry for `worker_id` and move its job
    /// to `Processing` in one atomic step. Concurrent callers never receive
    /// the same entry.
    async fn dequeue_next(
        &self,
        worker_id: &str,
        processing_node: Option<&str>,
    ) -> Result<Option<ClaimedJob>>;

    /// Current position of a job, `None` when it is not waiting.
    async fn queue_position(&self, id: JobId) -> Result<Option<i32>>;

    async fn snapshot(&self) -> Result<QueueSnapshot>;
}

/// What ranking needs to know about a queued entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RankCandidate {
    pub job_id: JobId,
    pub priority: JobPriority,
    pub queued_at: DateTime<Utc>,
}

impl RankCandidate {
    /// Dequeue order: heavier priority first, then earlier enqueue, then id
    /// so that ties are broken the same way on every pass.
    pub fn queue_order(&self, other: &Self) -> Ordering {
        other
            .priority
            .weight()
            .cmp(&self.priority.weight())
            .then_with(|| self.queued_at.cmp(&other.queued_at))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

/// Assign ranks `1..=N` to the given queued entries.
pub fn rank_queued(mut candidates: Vec<RankCandidate>) -> Vec<(JobId, i32)> {
    candidates.sort_by(RankCandidate::queue_order);
    candidates
        .into_iter()
        .enumerate()
        .map(|(idx, candidate)| (candidate.job_id, idx as i32 + 1))
        .collect()
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Per-priority entry statistics, keyed by priority name.
    pub priorities: HashMap<String, QueueSnapshotEntry>,
    /// The last position rebuild failed, so stored positions may be out of
    /// date.
    #[serde(default)]
    pub positions_stale: bool,
}

impl QueueSnapshot {
    /// Create a new queue snapshot at the given time.
    pub fn new(sampled_at: DateTime<Utc>) -> Self {
        Self {
            sampled_at,
            priorities: HashMap::new(),
            positions_stale: false,
        }
    }

    /// Get or create an entry for a priority.
    pub fn entry_mut(&mut self, priority: JobPriority) -> &mut QueueSnapshotEntry {
        self.priorities
            .entry(priority.as_str().to_string())
            .or_default()
    }

    pub fn queued_total(&self) -> usize {
        self.priorities.values().map(|entry| entry.queued_count).sum()
    }

    pub fn processing_total(&self) -> usize {
        self.priorities
            .values()
            .map(|entry| entry.processing_count)
            .sum()
    }
}

/// Statistics for a single priority level.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshotEntry {
    /// Number of entries waiting to be dequeued.
    pub queued_count: usize,
    /// Number of entries currently claimed by a worker.
    pub processing_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn candidate(priority: JobPriority, offset_secs: i64, base: DateTime<Utc>) -> RankCandidate {
        RankCandidate {
            job_id: JobId::new(),
            priority,
            queued_at: base + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_rank_orders_by_priority_then_age() {
        let base = Utc::now();
        let normal = candidate(JobPriority::Normal, 0, base);
        let high = candidate(JobPriority::High, 1, base);
        let urgent = candidate(JobPriority::Urgent, 2, base);
        let old_low = candidate(JobPriority::Low, -100, base);
        let early_high = candidate(JobPriority::High, -5, base);

        let ranked = rank_queued(vec![normal, high, urgent, old_low, early_high]);
        let order: Vec<JobId> = ranked.iter().map(|(id, _)| *id).collect();
        assert_eq!(
            order,
            vec![urgent.job_id, early_high.job_id, high.job_id, normal.job_id, old_low.job_id]
        );
        let positions: Vec<i32> = ranked.iter().map(|(_, pos)| *pos).collect();
        assert_eq!(positions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_rank_is_idempotent_regardless_of_input_order() {
        let base = Utc::now();
        let same_instant: Vec<RankCandidate> =
            (0..20).map(|_| candidate(JobPriority::Normal, 0, base)).collect();

        let first = rank_queued(same_instant.clone());
        let mut reversed = same_instant;
        reversed.reverse();
        let second = rank_queued(reversed);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rank_empty() {
        assert!(rank_queued(Vec::new()).is_empty());
    }

    #[test]
    fn test_snapshot_totals() {
        let mut snapshot = QueueSnapshot::new(Utc::now());
        snapshot.entry_mut(JobPriority::High).queued_count = 3;
        snapshot.entry_mut(JobPriority::Low).queued_count = 2;
        snapshot.entry_mut(JobPriority::Low).processing_count = 1;
        assert_eq!(snapshot.queued_total(), 5);
        assert_eq!(snapshot.processing_total(), 1);
    }
}
