//! A bounded queue for maintenance work that must never hold up a request.

use std::error::Error;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

/// Fire-and-forget tasks with an upper bound on how many may exist at once.
///
/// Spawning never waits: once the bound is reached further tasks are skipped. Failures are
/// logged and counted, never returned to whoever spawned the task.
#[derive(Debug, Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
}

impl BackgroundTasks {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(max_tasks.max(1))),
        }
    }

    /// Spawns `task` if there is room for it, returning whether it was spawned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, E>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Error + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            tracing::debug!(task = name, "Background queue is full, skipping task");
            metric!(counter("background.dropped") += 1, "task" => name);
            return false;
        };

        self.tracker.spawn(async move {
            let _permit = permit;
            if let Err(e) = task.await {
                tracing::warn!(error = &e as &dyn Error, task = name, "Background task failed");
                metric!(counter("background.failed") += 1, "task" => name);
            }
        });
        true
    }

    /// Number of tasks that are queued or running.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Waits until every task spawned so far has finished.
    ///
    /// Tasks spawned by those tasks are waited for as well. The queue stays usable afterwards.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}
