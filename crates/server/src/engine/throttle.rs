//! Leading and trailing edge throttle.

use super::tasks::TaskTracker;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct State {
    /// A run or its cool-down window is in progress.
    busy: bool,
    /// Triggered while busy; run once more when the window ends.
    pending: bool,
}

/// Runs an action at most once per window.
///
/// The first trigger runs the action immediately. Triggers that arrive while
/// the action runs or during the window after it collapse into exactly one
/// follow-up run at the end of the window.
#[derive(Clone)]
pub struct Throttle {
    name: &'static str,
    window: Duration,
    action: Action,
    state: Arc<Mutex<State>>,
    tasks: TaskTracker,
}

impl Throttle {
    pub fn new<F, Fut>(name: &'static str, window: Duration, tasks: TaskTracker, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: Action = Arc::new(move || Box::pin(action()));
        Self {
            name,
            window,
            action,
            state: Arc::new(Mutex::new(State::default())),
            tasks,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn trigger(&self) {
        {
            let mut state = self.state();
            if state.busy {
                state.pending = true;
                return;
            }
            state.busy = true;
        }

        let this = self.clone();
        self.tasks.spawn(self.name, async move {
            loop {
                (this.action)().await;
                tokio::time::sleep(this.window).await;

                let mut state = this.state();
                if state.pending {
                    state.pending = false;
                } else {
                    state.busy = false;
                    break;
                }
            }
        });
    }

    /// True while a run or its window is in progress.
    pub fn is_busy(&self) -> bool {
        self.state().busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(window: Duration) -> (Throttle, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let throttle = Throttle::new("test", window, TaskTracker::new(), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (throttle, runs)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn leading_edge_runs_immediately() {
        let (throttle, runs) = counting(Duration::from_secs(5));

        throttle.trigger();
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(throttle.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_trailing_run() {
        let (throttle, runs) = counting(Duration::from_secs(5));

        throttle.trigger();
        settle().await;
        for _ in 0..5 {
            throttle.trigger();
        }
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // No further triggers: the trailing run's window ends quietly.
        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!throttle.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_window_then_new_leading_edge() {
        let (throttle, runs) = counting(Duration::from_secs(1));

        throttle.trigger();
        settle().await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(!throttle.is_busy());

        throttle.trigger();
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
