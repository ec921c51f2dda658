//! Supervision for detached background work.
//!
//! Fire-and-forget work (owner quota recomputes, throttled stats refreshes)
//! never reports back to the request that triggered it. Spawning it through a
//! [`TaskTracker`] still gets failures and panics logged and counted, and lets
//! tests wait until everything in flight has settled.

use crate::metrics::BACKGROUND_TASK_FAILURES;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
}

/// Snapshot of tracker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Spawns and supervises detached tasks. Cloning shares the counters.
#[derive(Clone, Default)]
pub struct TaskTracker {
    counters: Arc<Counters>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a task whose failure can only be a panic.
    pub fn spawn<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.supervise(name, async move {
            future.await;
            true
        })
    }

    /// Spawn a task whose error is logged and counted instead of returned.
    pub fn spawn_fallible<F, E>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        self.supervise(name, async move {
            match future.await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(task = name, error = %e, "Background task failed");
                    false
                }
            }
        })
    }

    fn supervise<F>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = bool> + Send + 'static,
    {
        self.counters.active.fetch_add(1, Ordering::SeqCst);
        let counters = self.counters.clone();
        let task = tokio::spawn(future);

        tokio::spawn(async move {
            match task.await {
                Ok(true) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(false) => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    BACKGROUND_TASK_FAILURES.inc();
                }
                Err(join_err) if join_err.is_panic() => {
                    counters.failed.fetch_add(1, Ordering::SeqCst);
                    BACKGROUND_TASK_FAILURES.inc();
                    tracing::error!(task = name, panic = ?join_err, "Background task panicked");
                }
                Err(join_err) => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(task = name, error = ?join_err, "Background task was cancelled");
                }
            }
            if counters.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                counters.idle.notify_waiters();
            }
        })
    }

    pub fn counts(&self) -> TaskCounts {
        TaskCounts {
            active: self.counters.active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Wait until no tracked task is running. Tasks spawned by tracked tasks
    /// are waited for too, as long as they are spawned before their parent
    /// finishes.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
