//! Bounded pool for background connect tasks.
//!
//! Tasks are cheap tokio tasks, but only `workers` of them run their body at
//! once. Every task is tracked, and [`WorkerPool::shutdown`] cancels and
//! awaits all of them so nothing outlives the manager.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

#[derive(Debug)]
struct PoolInner {
    handle: Option<Handle>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    workers: usize,
}

/// Shared, cloneable handle to the pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create a pool running at most `workers` tasks concurrently.
    ///
    /// The runtime is captured when called from inside one; otherwise tasks
    /// are spawned on whichever runtime is current at [`WorkerPool::spawn`].
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                handle: Handle::try_current().ok(),
                permits: Arc::new(Semaphore::new(workers)),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                workers,
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Tasks spawned and not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.tracker.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Queue `task`. Returns false when the pool is shut down or no runtime
    /// is available.
    pub fn spawn<F>(&self, label: &str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            debug!(task = label, "pool shut down, dropping task");
            return false;
        }

        let handle = match self.inner.handle.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                warn!(task = label, "no tokio runtime available, dropping task");
                return false;
            }
        };

        let permits = Arc::clone(&self.inner.permits);
        let cancel = self.inner.cancel.clone();
        let label = label.to_string();

        self.inner.tracker.spawn_on(
            async move {
                let _permit = tokio::select! {
                    permit = permits.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = cancel.cancelled() => return,
                };

                tokio::select! {
                    _ = task => {}
                    _ = cancel.cancelled() => debug!(task = %label, "task cancelled"),
                }
            },
            &handle,
        );
        true
    }

    /// Cancel every task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.permits.close();
    }
}
