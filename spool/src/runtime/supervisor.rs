use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use super::context::{QueueBackend, QueueContext};
use super::worker::{run_worker, JobHandler, WorkerConfig};

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // registered before the flag check so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool and housekeeper around one [`QueueContext`].
pub struct QueueRuntime<B: QueueBackend> {
    context: QueueContext<B>,
    worker_config: WorkerConfig,
    shutdown_token: ShutdownToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: QueueBackend> fmt::Debug for QueueRuntime<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let task_count = self
            .task_handles
            .try_lock()
            .map(|handles| handles.len())
            .unwrap_or_default();

        f.debug_struct("QueueRuntime")
            .field("backend_type", &type_name::<B>())
            .field("worker_config", &self.worker_config)
            .field("task_count", &task_count)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl<B: QueueBackend> QueueRuntime<B> {
    pub fn new(context: QueueContext<B>) -> Self {
        Self {
            context,
            worker_config: WorkerConfig::default(),
            shutdown_token: ShutdownToken::new(),
            task_handles: Mutex::new(Vec::new()),
        }
    }

    /// Template for spawned workers; each gets `-w{n}` appended to its id.
    pub fn with_worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn context(&self) -> &QueueContext<B> {
        &self.context
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn `parallelism` workers that dequeue and run jobs through
    /// `handler` until shutdown.
    pub async fn spawn_workers<H>(&self, handler: Arc<H>, parallelism: usize)
    where
        H: JobHandler + ?Sized + 'static,
    {
        for i in 0..parallelism {
            let config = WorkerConfig {
                worker_id: format!("{}-w{}", self.worker_config.worker_id, i),
                ..self.worker_config.clone()
            };
            let handle = tokio::spawn(run_worker(
                self.context.clone(),
                Arc::clone(&handler),
                config,
                self.shutdown_token.clone(),
            ));
            self.task_handles.lock().await.push(handle);
        }
        tracing::info!(parallelism, "workers spawned");
    }

    /// Spawn the periodic maintenance task: retry sweep, escalation, overdue
    /// report and position rebuild on every tick, retention every
    /// `retention_every_ticks` ticks (never when zero).
    pub async fn spawn_housekeeper(&self) {
        let context = self.context.clone();
        let shutdown = self.shutdown_token.clone();
        let interval =
            tokio::time::Duration::from_millis(context.config().housekeeper_interval_ms);
        let retention_every = u64::from(context.config().retention_every_ticks);

        let handle = tokio::spawn(async move {
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        tick += 1;
                        housekeeping_pass(&context, tick, retention_every).await;
                    }
                }
            }
        });
        self.task_handles.lock().await.push(handle);
    }

    /// Signal shutdown and wait for every spawned task. Running handlers are
    /// allowed to finish their current job.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!("shutting down queue runtime");

        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.task_handles.lock().await;
            std::mem::take(&mut *guard)
        };

        for handle in handles {
            match tokio::time::timeout(tokio::time::Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("runtime task failed: {:?}", e),
                Err(_) => tracing::warn!("runtime task timed out during shutdown"),
            }
        }

        tracing::info!("queue runtime shutdown complete");
        Ok(())
    }
}

async fn housekeeping_pass<B: QueueBackend>(
    context: &QueueContext<B>,
    tick: u64,
    retention_every: u64,
) {
    match context.run_maintenance().await {
        Ok(report) => tracing::debug!(
            tick,
            requeued = report.requeued,
            escalated = report.escalated,
            overdue = report.overdue,
            ranked = report.ranked,
            "housekeeping pass finished"
        ),
        Err(err) => tracing::warn!(tick, error = %err, "housekeeping pass failed"),
    }

    if retention_every > 0 && tick % retention_every == 0 {
        if let Err(err) = context.apply_retention(context.retention_policy()).await {
            tracing::warn!(error = %err, "retention run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_token_shared_state() {
        let token = ShutdownToken::new();
        let clone1 = token.clone();
        let clone2 = token.clone();

        token.cancel();

        assert!(clone1.is_cancelled());
        assert!(clone2.is_cancelled());

        // must return immediately once cancelled
        timeout(Duration::from_secs(1), clone1.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_token_cancelled_wakes_clones() {
        let token = ShutdownToken::new();
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let clone = token.clone();
                tokio::spawn(async move { clone.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        for handle in handles {
            timeout(Duration::from_secs(5), handle)
                .await
                .expect("waiter did not observe cancellation within 5 seconds")
                .expect("waiter task panicked");
        }
    }

    #[tokio::test]
    async fn test_shutdown_token_default_not_cancelled() {
        let token = ShutdownToken::default();
        assert!(!token.is_cancelled());
    }
}
