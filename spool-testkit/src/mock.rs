use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spool::*;

/// Event sink that keeps everything it is given.
#[derive(Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().clone()
    }

    /// Events matching `predicate`, e.g. `|p| matches!(p, JobEventPayload::Failed { .. })`.
    pub fn count(&self, predicate: impl Fn(&JobEventPayload) -> bool) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| predicate(&event.payload))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Publisher that always errs, for checking that publishing failures never
/// fail the operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct FailingPublisher;

#[async_trait]
impl EventPublisher for FailingPublisher {
    async fn publish(&self, _event: JobEvent) -> anyhow::Result<()> {
        anyhow::bail!("event sink unavailable")
    }
}

#[derive(Clone, Debug)]
pub struct DispatchRecord {
    pub job_id: JobId,
    pub worker_id: Option<String>,
    pub priority: JobPriority,
}

/// Handler returning scripted outcomes in order, then `fallback`.
#[derive(Clone)]
pub struct ScriptedHandler {
    dispatches: Arc<Mutex<Vec<DispatchRecord>>>,
    script: Arc<Mutex<VecDeque<HandlerOutcome>>>,
    fallback: Arc<Mutex<HandlerOutcome>>,
    delay: Duration,
}

impl ScriptedHandler {
    pub fn new() -> Self {
        Self::with_fallback(HandlerOutcome::completed())
    }

    pub fn with_fallback(fallback: HandlerOutcome) -> Self {
        Self {
            dispatches: Arc::new(Mutex::new(Vec::new())),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback: Arc::new(Mutex::new(fallback)),
            delay: Duration::ZERO,
        }
    }

    /// Simulated work time per job.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_outcome(&self, outcome: HandlerOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn set_fallback(&self, outcome: HandlerOutcome) {
        *self.fallback.lock() = outcome;
    }

    pub fn record(&self) -> Vec<DispatchRecord> {
        self.dispatches.lock().clone()
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches.lock().len()
    }

    pub fn assert_dispatch_count_eq(&self, expected: usize) {
        let actual = self.dispatch_count();
        assert_eq!(
            actual, expected,
            "Expected {expected} dispatches, got {actual}"
        );
    }
}

impl Default for ScriptedHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for ScriptedHandler {
    async fn handle(&self, job: &ClaimedJob, progress: &dyn ProgressReporter) -> HandlerOutcome {
        self.dispatches.lock().push(DispatchRecord {
            job_id: job.job.id,
            worker_id: job.entry.worker_id.clone(),
            priority: job.job.priority,
        });

        if progress.report(50, Some("rendering")).await.is_err() {
            return HandlerOutcome::Cancelled;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().clone())
    }
}
